use data_contracts::{
    box_area, Detection, LabelSource, ManifestSample, ObjectLabel, PseudoLabel, SampleManifest,
    SampleManifestSchemaVersion, ValidationError,
};

#[test]
fn invalid_bbox_rejected() {
    let label = ObjectLabel {
        bbox: [0.8, 0.2, 0.1, 0.9],
        class_id: 0,
    };
    assert!(matches!(
        label.validate(3),
        Err(ValidationError::InvalidBbox(_))
    ));
}

#[test]
fn unknown_class_rejected() {
    let label = ObjectLabel {
        bbox: [0.1, 0.1, 0.2, 0.2],
        class_id: 3,
    };
    assert_eq!(
        label.validate(3),
        Err(ValidationError::UnknownClass {
            class_id: 3,
            num_classes: 3
        })
    );
}

#[test]
fn detection_score_must_be_probability() {
    let det = Detection {
        bbox: [0.1, 0.1, 0.2, 0.2],
        class_id: 1,
        score: 1.5,
    };
    assert!(matches!(
        det.validate(),
        Err(ValidationError::InvalidScore(_))
    ));
}

#[test]
fn pseudo_label_keeps_box_class_and_score() {
    let det = Detection {
        bbox: [0.1, 0.2, 0.5, 0.6],
        class_id: 2,
        score: 0.7,
    };
    let label = PseudoLabel::from_teacher(&det);
    assert_eq!(label.source, LabelSource::Teacher);
    assert_eq!(label.bbox, det.bbox);
    assert_eq!(label.class_id, 2);
    assert_eq!(label.score, 0.7);
    assert!((box_area(label.bbox) - 0.16).abs() < 1e-6);
}

#[test]
fn manifest_roundtrips_through_json_and_validates() {
    let manifest = SampleManifest {
        schema_version: SampleManifestSchemaVersion::V1,
        categories: vec!["broken".into(), "insulator".into()],
        samples: vec![
            ManifestSample {
                id: 1,
                width: 2,
                height: 1,
                pixels: vec![0.5; 6],
                annotations: Some(vec![ObjectLabel {
                    bbox: [0.0, 0.0, 0.5, 1.0],
                    class_id: 1,
                }]),
            },
            ManifestSample {
                id: 2,
                width: 2,
                height: 1,
                pixels: vec![0.25; 6],
                annotations: None,
            },
        ],
    };
    let json = serde_json::to_string(&manifest).unwrap();
    let parsed: SampleManifest = serde_json::from_str(&json).unwrap();
    assert!(parsed.validate().is_ok());
    assert_eq!(parsed.labeled_count(), 1);
    let samples = parsed.into_samples();
    assert!(samples[0].is_labeled());
    assert!(!samples[1].is_labeled());
}

#[test]
fn duplicate_ids_rejected() {
    let entry = ManifestSample {
        id: 9,
        width: 1,
        height: 1,
        pixels: vec![0.0; 3],
        annotations: None,
    };
    let manifest = SampleManifest {
        schema_version: SampleManifestSchemaVersion::V1,
        categories: vec!["a".into()],
        samples: vec![entry.clone(), entry],
    };
    assert_eq!(manifest.validate(), Err(ValidationError::DuplicateId(9)));
}

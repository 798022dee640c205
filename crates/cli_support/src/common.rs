use clap::Args;
use std::path::PathBuf;

/// Experiment config path shared by the train and eval binaries.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// TOML experiment config.
    #[arg(long)]
    pub config: PathBuf,
}

/// Output directory override.
#[derive(Debug, Clone, Args)]
pub struct WorkDirArgs {
    /// Overrides `work_dir` from the config.
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
}

impl WorkDirArgs {
    /// CLI value if given, else the config's, else `work_dirs/<config stem>`.
    pub fn resolve(&self, from_config: Option<&PathBuf>, config_path: &std::path::Path) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        if let Some(dir) = from_config {
            return dir.clone();
        }
        let stem = config_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("experiment");
        PathBuf::from("work_dirs").join(stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn work_dir_precedence() {
        let cli = WorkDirArgs {
            work_dir: Some(PathBuf::from("cli")),
        };
        let none = WorkDirArgs { work_dir: None };
        let cfg = PathBuf::from("cfg");
        let path = Path::new("configs/dino_ssod.toml");
        assert_eq!(cli.resolve(Some(&cfg), path), PathBuf::from("cli"));
        assert_eq!(none.resolve(Some(&cfg), path), PathBuf::from("cfg"));
        assert_eq!(
            none.resolve(None, path),
            PathBuf::from("work_dirs/dino_ssod")
        );
    }
}

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use models::Detector;
use std::marker::PhantomData;

/// Student on the autodiff backend, teacher on its inner backend.
///
/// The teacher cannot receive gradients: it lives on a backend without autodiff. It changes
/// only through the EMA/hard-copy entry points used by the Mean Teacher updater and through
/// checkpoint restore.
pub struct ModelPair<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    student: M,
    teacher: M::InnerModule,
    _backend: PhantomData<B>,
}

impl<B, M> ModelPair<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
    M::InnerModule: Detector<B::InnerBackend>,
{
    /// Teacher starts as a snapshot of the student.
    pub fn from_student(student: M) -> Self {
        let teacher = student.valid();
        Self::new(student, teacher)
    }

    /// Independently loaded teacher.
    pub fn new(student: M, teacher: M::InnerModule) -> Self {
        Self {
            student,
            teacher,
            _backend: PhantomData,
        }
    }

    pub fn student(&self) -> &M {
        &self.student
    }

    pub fn teacher(&self) -> &M::InnerModule {
        &self.teacher
    }

    pub fn into_parts(self) -> (M, M::InnerModule) {
        (self.student, self.teacher)
    }

    /// The only way to change the student, e.g. `|m| optim.step(lr, m, grads)`.
    pub fn update_student(self, step: impl FnOnce(M) -> M) -> Self {
        Self {
            student: step(self.student),
            teacher: self.teacher,
            _backend: PhantomData,
        }
    }

    pub(crate) fn ema_update(self, momentum: f64) -> Self {
        let snapshot = self.student.valid();
        Self {
            teacher: self.teacher.ema_blend(&snapshot, momentum),
            student: self.student,
            _backend: PhantomData,
        }
    }

    pub(crate) fn hard_copy(self) -> Self {
        Self::from_student(self.student)
    }
}

//! `NativeObj`: an opaque host value wrapped in a heap handle so it can
//! sit in a `Value` slot alongside everything else (§3.2, §6 embedding
//! API). The VM never looks inside one — only the host's own native
//! functions downcast it.

use std::any::Any;

pub struct NativeObjData {
    pub type_name: &'static str,
    data: Box<dyn Any + Send>,
    finalizer: Option<Box<dyn FnMut(&mut (dyn Any + Send)) + Send>>,
}

impl NativeObjData {
    pub fn new<T: Any + Send>(type_name: &'static str, data: T) -> Self {
        NativeObjData {
            type_name,
            data: Box::new(data),
            finalizer: None,
        }
    }

    pub fn with_finalizer<T: Any + Send>(
        type_name: &'static str,
        data: T,
        finalizer: impl FnMut(&mut (dyn Any + Send)) + Send + 'static,
    ) -> Self {
        NativeObjData {
            type_name,
            data: Box::new(data),
            finalizer: Some(Box::new(finalizer)),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    /// Invoked at most once, from the finalizer queue (§4.2), before the
    /// object is swept.
    pub fn run_finalizer(&mut self) {
        if let Some(mut f) = self.finalizer.take() {
            f(&mut *self.data);
        }
    }
}

impl std::fmt::Debug for NativeObjData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObjData")
            .field("type_name", &self.type_name)
            .field("has_finalizer", &self.finalizer.is_some())
            .finish()
    }
}

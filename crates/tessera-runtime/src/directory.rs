//! Subject directory: process-wide `SubjectId -> Arc<dyn Subject>` lookup
//! (§4.A). The registry maps external ids to subject ids and counts
//! references; this maps subject ids to the live subject instance the
//! pipeline actually reads and writes through.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::SubjectId;

use crate::subject::Subject;

pub struct SubjectDirectory {
    subjects: Mutex<HashMap<SubjectId, Arc<dyn Subject>>>,
}

impl SubjectDirectory {
    pub fn new() -> Self {
        Self {
            subjects: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, subject: Arc<dyn Subject>) {
        self.subjects.lock().insert(subject.subject_id(), subject);
    }

    pub fn remove(&self, subject: &SubjectId) -> Option<Arc<dyn Subject>> {
        self.subjects.lock().remove(subject)
    }

    pub fn get(&self, subject: &SubjectId) -> Option<Arc<dyn Subject>> {
        self.subjects.lock().get(subject).cloned()
    }

    pub fn len(&self) -> usize {
        self.subjects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubjectDirectory {
    fn default() -> Self {
        Self::new()
    }
}

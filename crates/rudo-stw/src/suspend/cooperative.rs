//! Cooperative suspension: threads poll a flag at safepoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Delivery, SuspendBackend};
use crate::config::SuspendKind;
use crate::registry::ThreadRecord;

/// Backend that raises a shared poll flag for the duration of a stop.
pub(crate) struct CooperativeBackend {
    poll: Arc<AtomicBool>,
}

impl CooperativeBackend {
    pub(crate) const fn new(poll: Arc<AtomicBool>) -> Self {
        Self { poll }
    }
}

impl SuspendBackend for CooperativeBackend {
    fn kind(&self) -> SuspendKind {
        SuspendKind::Cooperative
    }

    fn begin_stop(&self) {
        self.poll.store(true, Ordering::SeqCst);
    }

    fn request(&self, _record: &ThreadRecord) -> Delivery {
        // The poll flag is already up; the thread notices at its next safepoint.
        Delivery::Delivered
    }

    fn end_stop(&self) {
        self.poll.store(false, Ordering::Release);
    }

    fn wake(&self, record: &ThreadRecord) -> Delivery {
        record.parker.unpark();
        Delivery::Delivered
    }
}

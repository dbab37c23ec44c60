//! Test helper that implements [`datapart::UploadProgressCallback`] which keeps a record of every
//! progress update in order so we can write tests that verify behavior or progress reporting
//! functionality.
use datapart::UploadProgressCallback;
use more_asserts::*;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not all of these are used in tests but we want to capture all fields for all events
pub(crate) enum UploadProgressEvent {
    SessionStarted {
        object_name: String,
        upload_id: String,
        total_parts: usize,
        total_bytes: u64,
        resumed_parts: usize,
        resumed_bytes: u64,
    },

    PartStarted {
        part_number: u32,
        part_bytes: u64,
    },

    PartUploaded {
        part_number: u32,
        part_bytes: u64,
    },

    BytesTransferred {
        percent: f64,
        bytes: u64,
    },

    Paused,

    Resumed,

    ObjectNameAssigned {
        object_name: String,
    },

    UploadCompleted {
        object_name: String,
        total_bytes: u64,
    },
}

#[derive(Clone, Default)]
pub(crate) struct TestUploadProgressCallback {
    events: Arc<Mutex<Vec<UploadProgressEvent>>>,
}

// Helper macro to reduce boilerplate when matching on specific events
macro_rules! with_match {
    ($var:ident, $matches:pat, $block:block) => {
        if let $matches = $var {
            $block
        } else {
            unreachable!(
                "{}",
                concat!(
                    stringify!($var),
                    " does not match expression ",
                    stringify!($matches)
                )
            )
        }
    };
}

impl TestUploadProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Review all updates after a job has completed the upload, validating that the updates are
    /// sane and consistent with each other.
    ///
    /// If the job didn't complete the upload then this check should not be applied.
    pub fn sanity_check_completed(&self) {
        let (_, upload_id, total_parts, total_bytes, resumed_parts, resumed_bytes) =
            self.started_session();
        assert!(!upload_id.is_empty());

        // Every part that wasn't resumed was started and uploaded exactly once, and together they
        // cover the rest of the file
        let (started, started_bytes) = self.parts_started();
        let (uploaded, uploaded_bytes) = self.parts_uploaded();
        assert_eq!(started, uploaded);
        assert_eq!(started_bytes, uploaded_bytes);
        assert_eq!(total_parts, resumed_parts + uploaded);
        assert_eq!(total_bytes, resumed_bytes + uploaded_bytes);

        let mut part_numbers = self.uploaded_part_numbers();
        let count = part_numbers.len();
        part_numbers.sort_unstable();
        part_numbers.dedup();
        assert_eq!(count, part_numbers.len(), "a part was uploaded twice");

        // The byte counter never goes past the file size, and the last report covers the file
        let reports = self.byte_reports();
        assert!(!reports.is_empty());
        for (percent, _) in &reports {
            assert_le!(*percent, 100.0 + f64::EPSILON);
        }
        let (last_percent, _) = reports[reports.len() - 1];
        assert!((last_percent - 100.0).abs() < 1e-9);

        let (completed_name, completed_bytes) = self.completion();
        assert_eq!(total_bytes, completed_bytes);
        assert!(!completed_name.is_empty());
    }

    pub fn events(&self) -> Vec<UploadProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn started_session(&self) -> (String, String, usize, u64, usize, u64) {
        let event = self
            .filter_single_event(UploadProgressEventDiscriminants::SessionStarted)
            .unwrap();
        with_match!(
            event,
            UploadProgressEvent::SessionStarted {
                object_name,
                upload_id,
                total_parts,
                total_bytes,
                resumed_parts,
                resumed_bytes
            },
            {
                (
                    object_name,
                    upload_id,
                    total_parts,
                    total_bytes,
                    resumed_parts,
                    resumed_bytes,
                )
            }
        )
    }

    /// The number of part started events, and the total size of all of them combined
    pub fn parts_started(&self) -> (usize, u64) {
        let events = self.filter_events(UploadProgressEventDiscriminants::PartStarted);
        let count = events.len();
        let sum = events
            .into_iter()
            .map(|event| {
                with_match!(event, UploadProgressEvent::PartStarted { part_bytes, .. }, {
                    part_bytes
                })
            })
            .sum();

        (count, sum)
    }

    /// The number of part uploaded events, and the total size of all of them combined
    pub fn parts_uploaded(&self) -> (usize, u64) {
        let events = self.filter_events(UploadProgressEventDiscriminants::PartUploaded);
        let count = events.len();
        let sum = events
            .into_iter()
            .map(|event| {
                with_match!(event, UploadProgressEvent::PartUploaded { part_bytes, .. }, {
                    part_bytes
                })
            })
            .sum();

        (count, sum)
    }

    pub fn uploaded_part_numbers(&self) -> Vec<u32> {
        self.filter_events(UploadProgressEventDiscriminants::PartUploaded)
            .into_iter()
            .map(|event| {
                with_match!(event, UploadProgressEvent::PartUploaded { part_number, .. }, {
                    part_number
                })
            })
            .collect()
    }

    /// Every byte counter report, in order, as `(percent, bytes)`
    pub fn byte_reports(&self) -> Vec<(f64, u64)> {
        self.filter_events(UploadProgressEventDiscriminants::BytesTransferred)
            .into_iter()
            .map(|event| {
                with_match!(
                    event,
                    UploadProgressEvent::BytesTransferred { percent, bytes },
                    { (percent, bytes) }
                )
            })
            .collect()
    }

    /// The byte count of the last byte counter report
    pub fn last_reported_bytes(&self) -> Option<u64> {
        self.byte_reports().last().map(|(_, bytes)| *bytes)
    }

    pub fn assigned_object_names(&self) -> Vec<String> {
        self.filter_events(UploadProgressEventDiscriminants::ObjectNameAssigned)
            .into_iter()
            .map(|event| {
                with_match!(
                    event,
                    UploadProgressEvent::ObjectNameAssigned { object_name },
                    { object_name }
                )
            })
            .collect()
    }

    pub fn completion(&self) -> (String, u64) {
        let event = self
            .filter_single_event(UploadProgressEventDiscriminants::UploadCompleted)
            .unwrap();
        with_match!(
            event,
            UploadProgressEvent::UploadCompleted {
                object_name,
                total_bytes
            },
            { (object_name, total_bytes) }
        )
    }

    pub fn count(&self, typ: UploadProgressEventDiscriminants) -> usize {
        self.filter_events(typ).len()
    }

    /// Iterate over all events of a certain type
    pub fn filter_events(&self, typ: UploadProgressEventDiscriminants) -> Vec<UploadProgressEvent> {
        let events = self.events.lock().unwrap();

        events
            .iter()
            .filter(|event| {
                let event_typ: UploadProgressEventDiscriminants = (*event).into();

                event_typ == typ
            })
            .cloned()
            .collect()
    }

    /// Get the single event of a certain type, panicking if there is more than one
    pub fn filter_single_event(
        &self,
        typ: UploadProgressEventDiscriminants,
    ) -> Option<UploadProgressEvent> {
        let mut events = self.filter_events(typ);

        assert!(
            events.len() <= 1,
            "expected at most one {typ:?} event, got {}",
            events.len()
        );

        events.pop()
    }

    fn report(&self, event: UploadProgressEvent) {
        self.events.lock().unwrap().push(event)
    }
}

impl UploadProgressCallback for TestUploadProgressCallback {
    fn session_started(
        &self,
        object_name: &str,
        upload_id: &str,
        total_parts: usize,
        total_bytes: u64,
        resumed_parts: usize,
        resumed_bytes: u64,
    ) {
        self.report(UploadProgressEvent::SessionStarted {
            object_name: object_name.to_string(),
            upload_id: upload_id.to_string(),
            total_parts,
            total_bytes,
            resumed_parts,
            resumed_bytes,
        })
    }

    fn part_started(&self, part_number: u32, part_bytes: u64) {
        self.report(UploadProgressEvent::PartStarted {
            part_number,
            part_bytes,
        })
    }

    fn part_uploaded(&self, part_number: u32, part_bytes: u64) {
        self.report(UploadProgressEvent::PartUploaded {
            part_number,
            part_bytes,
        })
    }

    fn bytes_transferred(&self, percent: f64, bytes: u64) {
        self.report(UploadProgressEvent::BytesTransferred { percent, bytes })
    }

    fn paused(&self) {
        self.report(UploadProgressEvent::Paused)
    }

    fn resumed(&self) {
        self.report(UploadProgressEvent::Resumed)
    }

    fn object_name_assigned(&self, object_name: &str) {
        self.report(UploadProgressEvent::ObjectNameAssigned {
            object_name: object_name.to_string(),
        })
    }

    fn upload_completed(&self, object_name: &str, total_bytes: u64) {
        self.report(UploadProgressEvent::UploadCompleted {
            object_name: object_name.to_string(),
            total_bytes,
        })
    }
}

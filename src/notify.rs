//! Notification gating.
//!
//! Detections whose label is on the watch list raise a `DetectionEvent`,
//! at most once per label per cooldown window. The gate is clock-agnostic;
//! callers pass `now` so tests do not have to sleep through cooldowns.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use log::{info, warn};

use crate::config::NotifySettings;
use crate::detect::DetectionSet;

/// One raised alert.
#[derive(Clone, Debug)]
pub struct DetectionEvent {
    pub label: String,
    pub confidence: f32,
    pub timestamp: SystemTime,
}

/// Delivery seam for alerts. Failures are logged and absorbed; a broken
/// channel must not stall the capture loop.
pub trait Notifier: Send {
    fn notify(&mut self, event: &DetectionEvent) -> Result<()>;
}

/// Default notifier: writes the alert to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, event: &DetectionEvent) -> Result<()> {
        info!(
            "ALERT: {} detected (confidence {:.2})",
            event.label, event.confidence
        );
        Ok(())
    }
}

pub struct NotificationGate {
    watch: HashSet<String>,
    cooldown: Duration,
    last_fired: HashMap<String, Instant>,
    notifier: Box<dyn Notifier>,
}

impl NotificationGate {
    pub fn new(settings: &NotifySettings, notifier: Box<dyn Notifier>) -> Self {
        Self {
            watch: settings.watch_labels.iter().cloned().collect(),
            cooldown: settings.cooldown,
            last_fired: HashMap::new(),
            notifier,
        }
    }

    /// Evaluate one tick's detections. Returns the number of events raised.
    ///
    /// The cooldown stamp is recorded before delivery, so a notifier that
    /// fails does not get retried every tick for the same sighting.
    pub fn process(&mut self, detections: &DetectionSet, now: Instant) -> usize {
        let mut fired = 0;
        for det in &detections.detections {
            if !self.watch.contains(&det.label) {
                continue;
            }
            let cooling = match self.last_fired.get(&det.label) {
                Some(at) => now.duration_since(*at) < self.cooldown,
                None => false,
            };
            if cooling {
                continue;
            }
            self.last_fired.insert(det.label.clone(), now);
            let event = DetectionEvent {
                label: det.label.clone(),
                confidence: det.confidence,
                timestamp: SystemTime::now(),
            };
            if let Err(err) = self.notifier.notify(&event) {
                warn!("notifier failed for '{}': {:#}", event.label, err);
            }
            fired += 1;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::detect::{BoundingBox, Detection};

    struct RecordingNotifier(Arc<Mutex<Vec<String>>>);

    impl Notifier for RecordingNotifier {
        fn notify(&mut self, event: &DetectionEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.label.clone());
            Ok(())
        }
    }

    fn settings() -> NotifySettings {
        NotifySettings {
            cooldown: Duration::from_secs(30),
            watch_labels: vec!["person".to_string(), "dog".to_string()],
        }
    }

    fn set_of(labels: &[&str]) -> DetectionSet {
        DetectionSet {
            frame_seq: 1,
            detections: labels
                .iter()
                .map(|label| Detection {
                    label: label.to_string(),
                    confidence: 0.9,
                    bbox: BoundingBox {
                        x: 0,
                        y: 0,
                        width: 4,
                        height: 4,
                    },
                })
                .collect(),
        }
    }

    fn gate_with_log() -> (NotificationGate, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = NotificationGate::new(
            &settings(),
            Box::new(RecordingNotifier(Arc::clone(&log))),
        );
        (gate, log)
    }

    #[test]
    fn fires_once_per_label_within_cooldown() {
        let (mut gate, log) = gate_with_log();
        let t0 = Instant::now();

        assert_eq!(gate.process(&set_of(&["person"]), t0), 1);
        assert_eq!(
            gate.process(&set_of(&["person"]), t0 + Duration::from_secs(10)),
            0
        );
        assert_eq!(
            gate.process(&set_of(&["person"]), t0 + Duration::from_secs(31)),
            1
        );
        assert_eq!(*log.lock().unwrap(), vec!["person", "person"]);
    }

    #[test]
    fn cooldowns_are_independent_per_label() {
        let (mut gate, log) = gate_with_log();
        let t0 = Instant::now();

        gate.process(&set_of(&["person"]), t0);
        let fired = gate.process(&set_of(&["person", "dog"]), t0 + Duration::from_secs(5));
        assert_eq!(fired, 1, "person cooling, dog fresh");
        assert_eq!(*log.lock().unwrap(), vec!["person", "dog"]);
    }

    #[test]
    fn unwatched_labels_never_fire() {
        let (mut gate, log) = gate_with_log();
        assert_eq!(gate.process(&set_of(&["car"]), Instant::now()), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_labels_in_one_tick_fire_once() {
        let (mut gate, log) = gate_with_log();
        assert_eq!(gate.process(&set_of(&["person", "person"]), Instant::now()), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn failing_notifier_still_consumes_cooldown() {
        struct FailingNotifier;
        impl Notifier for FailingNotifier {
            fn notify(&mut self, _event: &DetectionEvent) -> Result<()> {
                Err(anyhow::anyhow!("channel down"))
            }
        }

        let mut gate = NotificationGate::new(&settings(), Box::new(FailingNotifier));
        let t0 = Instant::now();
        assert_eq!(gate.process(&set_of(&["person"]), t0), 1);
        assert_eq!(
            gate.process(&set_of(&["person"]), t0 + Duration::from_secs(1)),
            0
        );
    }
}

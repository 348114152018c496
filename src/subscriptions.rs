//! Registry of standing data subscriptions.
//!
//! Records are keyed by the caller-assigned request id. Inbound values are
//! decoded and stored here before any handler sees them. Delivery and removal
//! are serialized by a gate, so once `remove` returns no handler call for that
//! id can start, even for a value that was already in flight.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::error::ClientError;
use crate::models::{DataRequest, DataRequestRecord, DataValue};

thread_local! {
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a delivery until dropped.
struct DeliveryScope;

impl DeliveryScope {
    fn enter() -> Self {
        DELIVERING.with(|d| d.set(true));
        DeliveryScope
    }

    fn active() -> bool {
        DELIVERING.with(|d| d.get())
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(false));
    }
}

/// Outcome of routing one data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Value decoded and handed to the callback.
    Delivered,
    /// No subscription with that id (never registered, or removed).
    Dropped,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    records: Mutex<HashMap<u32, DataRequestRecord>>,
    gate: Mutex<()>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<u32, DataRequestRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gate(&self) -> Option<MutexGuard<'_, ()>> {
        // A handler removing a subscription already holds the gate on this thread.
        if DeliveryScope::active() {
            None
        } else {
            Some(self.gate.lock().unwrap_or_else(|e| e.into_inner()))
        }
    }

    /// Add a subscription. Duplicate ids are rejected and the existing
    /// record is kept.
    pub fn register(&self, request: DataRequest) -> Result<(), ClientError> {
        let mut records = self.records();
        if records.contains_key(&request.request_id) {
            return Err(ClientError::AlreadyExists(request.request_id));
        }
        records.insert(request.request_id, DataRequestRecord::new(request));
        Ok(())
    }

    /// Decode `bytes` for `request_id`, store the value, then call `deliver`
    /// with the updated record while holding the gate.
    ///
    /// A decode failure leaves the stored value untouched.
    pub fn deliver<F>(&self, request_id: u32, bytes: &[u8], deliver: F) -> Result<Delivery, ClientError>
    where
        F: FnOnce(&DataRequestRecord),
    {
        let _gate = self.gate();

        let record = {
            let mut records = self.records();
            let Some(record) = records.get_mut(&request_id) else {
                return Ok(Delivery::Dropped);
            };
            let value = DataValue::decode(record.request.value_type, bytes)?;
            record.value = Some(value);
            record.last_update = Some(Utc::now());
            record.clone()
        };

        let _scope = DeliveryScope::enter();
        deliver(&record);
        Ok(Delivery::Delivered)
    }

    /// Remove one subscription. Waits for an in-progress delivery to finish.
    pub fn remove(&self, request_id: u32) -> Option<DataRequestRecord> {
        let _gate = self.gate();
        self.records().remove(&request_id)
    }

    /// Remove everything; used on disconnect and dispose.
    pub fn remove_all(&self) -> usize {
        let _gate = self.gate();
        let mut records = self.records();
        let count = records.len();
        records.clear();
        count
    }

    pub fn get(&self, request_id: u32) -> Option<DataRequestRecord> {
        self.records().get(&request_id).cloned()
    }

    pub fn contains(&self, request_id: u32) -> bool {
        self.records().contains_key(&request_id)
    }

    /// All records, ordered by request id.
    pub fn snapshot(&self) -> Vec<DataRequestRecord> {
        let mut records: Vec<_> = self.records().values().cloned().collect();
        records.sort_by_key(|r| r.request_id());
        records
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<_> = self.records().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CalcResultType, UpdatePeriod, ValueType};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn rpm_request(id: u32) -> DataRequest {
        DataRequest::calculated(id, CalcResultType::Double, "(A:ENGINE RPM:1,rpm)", ValueType::Float64)
            .with_period(UpdatePeriod::PerSecond, 0)
    }

    #[test]
    fn test_duplicate_id_rejected_and_first_kept() {
        let registry = SubscriptionRegistry::new();
        registry.register(rpm_request(1)).unwrap();

        let mut second = rpm_request(1);
        second.name_or_code = "(L:Other)".into();
        let err = registry.register(second).unwrap_err();
        assert!(matches!(err, ClientError::AlreadyExists(1)));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(1).unwrap().request.name_or_code,
            "(A:ENGINE RPM:1,rpm)"
        );
    }

    #[test]
    fn test_deliver_decodes_and_caches() {
        let registry = SubscriptionRegistry::new();
        registry.register(rpm_request(1)).unwrap();

        let mut seen = Vec::new();
        let outcome = registry
            .deliver(1, &2400.0f64.to_le_bytes(), |record| {
                seen.push(record.value.clone())
            })
            .unwrap();

        assert_eq!(outcome, Delivery::Delivered);
        assert_eq!(seen, vec![Some(DataValue::Float64(2400.0))]);
        let cached = registry.get(1).unwrap();
        assert_eq!(cached.value, Some(DataValue::Float64(2400.0)));
        assert!(cached.last_update.is_some());
    }

    #[test]
    fn test_deliver_unknown_id_is_dropped() {
        let registry = SubscriptionRegistry::new();
        let outcome = registry
            .deliver(9, &[0; 8], |_| panic!("no handler for unknown id"))
            .unwrap();
        assert_eq!(outcome, Delivery::Dropped);
    }

    #[test]
    fn test_deliver_short_payload_is_protocol_error() {
        let registry = SubscriptionRegistry::new();
        registry.register(rpm_request(1)).unwrap();
        let result = registry.deliver(1, &[1, 2], |_| panic!("must not deliver"));
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert_eq!(registry.get(1).unwrap().value, None);
    }

    #[test]
    fn test_snapshot_reflects_removal() {
        let registry = SubscriptionRegistry::new();
        for id in [3, 1, 2] {
            registry.register(rpm_request(id)).unwrap();
        }
        assert_eq!(registry.ids(), vec![1, 2, 3]);

        assert!(registry.remove(2).is_some());
        assert!(registry.remove(2).is_none());
        assert_eq!(registry.ids(), vec![1, 3]);
        let ids: Vec<u32> = registry.snapshot().iter().map(|r| r.request_id()).collect();
        assert_eq!(ids, vec![1, 3]);

        assert_eq!(registry.remove_all(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_can_remove_its_own_subscription() {
        let registry = SubscriptionRegistry::new();
        registry.register(rpm_request(1)).unwrap();

        registry
            .deliver(1, &1.0f64.to_le_bytes(), |record| {
                assert!(registry.remove(record.request_id()).is_some());
            })
            .unwrap();

        assert!(!registry.contains(1));
        let outcome = registry
            .deliver(1, &1.0f64.to_le_bytes(), |_| panic!("removed"))
            .unwrap();
        assert_eq!(outcome, Delivery::Dropped);
    }

    #[test]
    fn test_remove_waits_for_inflight_delivery() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.register(rpm_request(1)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let delivering = {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            std::thread::spawn(move || {
                registry
                    .deliver(1, &1.0f64.to_le_bytes(), |_| {
                        entered_tx.send(()).unwrap();
                        std::thread::sleep(Duration::from_millis(50));
                        calls.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            })
        };

        entered_rx.recv().unwrap();
        registry.remove(1);
        // The in-flight call completed before remove returned.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let outcome = registry
            .deliver(1, &1.0f64.to_le_bytes(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(outcome, Delivery::Dropped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        delivering.join().unwrap();
    }
}

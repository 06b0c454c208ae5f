//! In-memory store for tests and ephemeral runs. Same semantics as the
//! Postgres store, including invariant validation and cascade removal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::models::{Customer, DueTarget, HealthState, ProbeOutcome, Target, Thresholds};
use super::{StoreError, TargetStore};

#[derive(Default)]
struct State {
    customers: HashMap<i64, Customer>,
    targets: HashMap<i64, Target>,
    history: Vec<ProbeOutcome>,
    next_customer_id: i64,
    next_target_id: i64,
}

pub struct MemoryStore {
    state: RwLock<State>,
    min_interval_seconds: u32,
}

impl MemoryStore {
    pub fn new(min_interval_seconds: u32) -> Self {
        Self {
            state: RwLock::new(State {
                next_customer_id: 1,
                next_target_id: 1,
                ..State::default()
            }),
            min_interval_seconds,
        }
    }
}

fn customer_id_by_chat(state: &State, chat_id: i64) -> Option<i64> {
    state
        .customers
        .values()
        .find(|c| c.chat_id == chat_id)
        .map(|c| c.id)
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn list_due_targets(&self, now: DateTime<Utc>) -> Result<Vec<DueTarget>, StoreError> {
        let state = self.state.read().unwrap();
        let mut due = Vec::new();
        for target in state.targets.values() {
            if !target.enabled {
                continue;
            }
            let Some(customer) = state.customers.get(&target.customer_id) else {
                continue;
            };
            if !customer.alerts_enabled {
                continue;
            }
            let interval = customer.interval_seconds.max(self.min_interval_seconds) as i64;
            let is_due = match target.last_checked_at {
                None => true,
                Some(last) => (now - last).num_seconds() >= interval,
            };
            if is_due {
                due.push(DueTarget {
                    target: target.clone(),
                    chat_id: customer.chat_id,
                    thresholds: customer.thresholds,
                });
            }
        }
        Ok(due)
    }

    async fn get_target(&self, target_id: i64) -> Result<Option<Target>, StoreError> {
        Ok(self.state.read().unwrap().targets.get(&target_id).cloned())
    }

    async fn record_outcome(&self, outcome: &ProbeOutcome) -> Result<(), StoreError> {
        self.state.write().unwrap().history.push(outcome.clone());
        Ok(())
    }

    async fn update_health(
        &self,
        target_id: i64,
        failures: u32,
        state: HealthState,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.write().unwrap();
        let target = guard
            .targets
            .get_mut(&target_id)
            .ok_or(StoreError::TargetNotFound(target_id, String::new()))?;
        target.consecutive_failures = failures;
        target.health = state;
        target.last_checked_at = Some(checked_at);
        Ok(())
    }

    async fn list_enabled_customers(&self) -> Result<Vec<Customer>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .customers
            .values()
            .filter(|c| c.alerts_enabled)
            .cloned()
            .collect())
    }

    async fn count_enabled_targets(&self) -> Result<u64, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state.targets.values().filter(|t| t.enabled).count() as u64)
    }

    async fn get_customer_by_chat(&self, chat_id: i64) -> Result<Option<Customer>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state.customers.values().find(|c| c.chat_id == chat_id).cloned())
    }

    async fn create_customer(
        &self,
        chat_id: i64,
        interval_seconds: u32,
        thresholds: Thresholds,
    ) -> Result<Customer, StoreError> {
        thresholds.validate().map_err(StoreError::InvalidConfig)?;
        if interval_seconds < self.min_interval_seconds {
            return Err(StoreError::InvalidConfig(format!(
                "interval {interval_seconds}s below minimum {}s",
                self.min_interval_seconds
            )));
        }
        let mut state = self.state.write().unwrap();
        if let Some(id) = customer_id_by_chat(&state, chat_id) {
            return Ok(state.customers[&id].clone());
        }
        let id = state.next_customer_id;
        state.next_customer_id += 1;
        let customer = Customer {
            id,
            chat_id,
            alerts_enabled: true,
            interval_seconds,
            thresholds,
            created_at: Utc::now(),
        };
        state.customers.insert(id, customer.clone());
        Ok(customer)
    }

    async fn update_thresholds(
        &self,
        chat_id: i64,
        thresholds: Thresholds,
    ) -> Result<(), StoreError> {
        thresholds.validate().map_err(StoreError::InvalidConfig)?;
        let mut state = self.state.write().unwrap();
        let id = customer_id_by_chat(&state, chat_id)
            .ok_or(StoreError::CustomerNotFound(chat_id))?;
        state.customers.get_mut(&id).unwrap().thresholds = thresholds;
        Ok(())
    }

    async fn set_interval(&self, chat_id: i64, interval_seconds: u32) -> Result<(), StoreError> {
        if interval_seconds < self.min_interval_seconds {
            return Err(StoreError::InvalidConfig(format!(
                "interval {interval_seconds}s below minimum {}s",
                self.min_interval_seconds
            )));
        }
        let mut state = self.state.write().unwrap();
        let id = customer_id_by_chat(&state, chat_id)
            .ok_or(StoreError::CustomerNotFound(chat_id))?;
        state.customers.get_mut(&id).unwrap().interval_seconds = interval_seconds;
        Ok(())
    }

    async fn set_alerts_enabled(&self, chat_id: i64, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        let id = customer_id_by_chat(&state, chat_id)
            .ok_or(StoreError::CustomerNotFound(chat_id))?;
        state.customers.get_mut(&id).unwrap().alerts_enabled = enabled;
        Ok(())
    }

    async fn upsert_target(
        &self,
        customer_id: i64,
        name: &str,
        ip: &str,
        port: u16,
    ) -> Result<Target, StoreError> {
        let mut state = self.state.write().unwrap();
        if !state.customers.contains_key(&customer_id) {
            return Err(StoreError::CustomerNotFound(customer_id));
        }
        if let Some(existing) = state
            .targets
            .values_mut()
            .find(|t| t.customer_id == customer_id && t.name == name)
        {
            existing.ip = ip.to_string();
            existing.port = port;
            existing.enabled = true;
            return Ok(existing.clone());
        }
        let id = state.next_target_id;
        state.next_target_id += 1;
        let target = Target {
            id,
            customer_id,
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            enabled: true,
            last_checked_at: None,
            consecutive_failures: 0,
            health: HealthState::Healthy,
        };
        state.targets.insert(id, target.clone());
        Ok(target)
    }

    async fn set_target_enabled(
        &self,
        customer_id: i64,
        name: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        let target = state
            .targets
            .values_mut()
            .find(|t| t.customer_id == customer_id && t.name == name)
            .ok_or_else(|| StoreError::TargetNotFound(customer_id, name.to_string()))?;
        target.enabled = enabled;
        Ok(())
    }

    async fn remove_target(&self, customer_id: i64, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().unwrap();
        let id = state
            .targets
            .values()
            .find(|t| t.customer_id == customer_id && t.name == name)
            .map(|t| t.id);
        Ok(match id {
            Some(id) => {
                state.targets.remove(&id);
                true
            }
            None => false,
        })
    }

    async fn remove_customer(&self, chat_id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.write().unwrap();
        let Some(id) = customer_id_by_chat(&state, chat_id) else {
            return Ok(false);
        };
        state.customers.remove(&id);
        state.targets.retain(|_, t| t.customer_id != id);
        Ok(true)
    }

    async fn history(&self, customer_id: i64, limit: u32) -> Result<Vec<ProbeOutcome>, StoreError> {
        let state = self.state.read().unwrap();
        let target_ids: Vec<i64> = state
            .targets
            .values()
            .filter(|t| t.customer_id == customer_id)
            .map(|t| t.id)
            .collect();
        let mut outcomes: Vec<ProbeOutcome> = state
            .history
            .iter()
            .filter(|o| target_ids.contains(&o.target_id))
            .cloned()
            .collect();
        outcomes.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        outcomes.truncate(limit as usize);
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const T: Thresholds = Thresholds { failure: 3, escalation: 5 };

    async fn store_with_target() -> (MemoryStore, Customer, Target) {
        let store = MemoryStore::new(20);
        let customer = store.create_customer(100, 60, T).await.unwrap();
        let target = store
            .upsert_target(customer.id, "web", "10.0.0.1", 443)
            .await
            .unwrap();
        (store, customer, target)
    }

    #[tokio::test]
    async fn never_checked_target_is_due() {
        let (store, _, target) = store_with_target().await;
        let due = store.list_due_targets(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].target.id, target.id);
        assert_eq!(due[0].chat_id, 100);
        assert_eq!(due[0].thresholds, T);
    }

    #[tokio::test]
    async fn due_respects_interval_and_minimum() {
        let (store, _, target) = store_with_target().await;
        let now = Utc::now();
        store
            .update_health(target.id, 0, HealthState::Healthy, now)
            .await
            .unwrap();

        // Checked just now: not due.
        assert!(store.list_due_targets(now).await.unwrap().is_empty());
        // 59s later with a 60s interval: still not due.
        assert!(store
            .list_due_targets(now + ChronoDuration::seconds(59))
            .await
            .unwrap()
            .is_empty());
        // 60s later: due.
        assert_eq!(
            store
                .list_due_targets(now + ChronoDuration::seconds(60))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn disabled_target_and_customer_are_skipped() {
        let (store, customer, _) = store_with_target().await;
        store
            .set_target_enabled(customer.id, "web", false)
            .await
            .unwrap();
        assert!(store.list_due_targets(Utc::now()).await.unwrap().is_empty());

        store.set_target_enabled(customer.id, "web", true).await.unwrap();
        store.set_alerts_enabled(100, false).await.unwrap();
        assert!(store.list_due_targets(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected() {
        let store = MemoryStore::new(20);
        let bad = Thresholds { failure: 5, escalation: 3 };
        assert!(matches!(
            store.create_customer(1, 60, bad).await,
            Err(StoreError::InvalidConfig(_))
        ));
        // Interval below the configured minimum.
        assert!(matches!(
            store.create_customer(1, 5, T).await,
            Err(StoreError::InvalidConfig(_))
        ));

        let customer = store.create_customer(1, 60, T).await.unwrap();
        assert!(matches!(
            store.update_thresholds(customer.chat_id, bad).await,
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(matches!(
            store.set_interval(customer.chat_id, 1).await,
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn upsert_target_updates_and_reenables() {
        let (store, customer, target) = store_with_target().await;
        store
            .set_target_enabled(customer.id, "web", false)
            .await
            .unwrap();
        let updated = store
            .upsert_target(customer.id, "web", "10.0.0.2", 8443)
            .await
            .unwrap();
        assert_eq!(updated.id, target.id);
        assert_eq!(updated.ip, "10.0.0.2");
        assert_eq!(updated.port, 8443);
        assert!(updated.enabled);
    }

    #[tokio::test]
    async fn remove_customer_cascades_to_targets() {
        let (store, _, target) = store_with_target().await;
        assert!(store.remove_customer(100).await.unwrap());
        assert!(store.get_target(target.id).await.unwrap().is_none());
        assert_eq!(store.count_enabled_targets().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_bounded() {
        let (store, customer, target) = store_with_target().await;
        let base = Utc::now();
        for i in 0..5 {
            store
                .record_outcome(&ProbeOutcome {
                    target_id: target.id,
                    checked_at: base + ChronoDuration::seconds(i),
                    success: i % 2 == 0,
                    latency_ms: Some(10),
                    error: None,
                })
                .await
                .unwrap();
        }
        let history = store.history(customer.id, 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].checked_at > history[1].checked_at);
        assert!(history[1].checked_at > history[2].checked_at);
    }
}

//! Mutex lock recovery so one panicking caller does not wedge a shared pool.

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(context, "mutex poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::lock_or_recover;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn returns_guard_for_healthy_lock() {
        let lock = Mutex::new(HashMap::from([("sessions", 1_usize)]));
        lock_or_recover(&lock, "healthy")
            .entry("sessions")
            .and_modify(|count| *count += 1);

        let value = match lock.lock() {
            Ok(guard) => guard.get("sessions").copied(),
            Err(_) => panic!("lock should not be poisoned"),
        };
        assert_eq!(value, Some(2));
    }

    #[test]
    fn recovers_poisoned_registry_map() {
        let lock = Mutex::new(vec!["master-a".to_string()]);
        let _ = std::panic::catch_unwind(|| {
            let _guard = match lock.lock() {
                Ok(guard) => guard,
                Err(_) => panic!("first acquisition should succeed"),
            };
            panic!("poison the registry lock");
        });
        assert!(lock.is_poisoned());

        lock_or_recover(&lock, "poisoned").push("master-b".to_string());

        let value = match lock.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        assert_eq!(value, vec!["master-a".to_string(), "master-b".to_string()]);
    }
}

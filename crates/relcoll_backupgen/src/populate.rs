//! Batched dictionary population with visibility checks.

use relcoll_core::{CoreError, CoreResult, StateProviderName, TransactionalReplicator};
use std::sync::Arc;

fn expect_count(stage: impl FnOnce() -> String, expected: u64, actual: u64) -> CoreResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::consistency_violation(stage(), expected, actual))
    }
}

/// One past the last key a population writes.
///
/// Fails with `InvalidState` when the keys do not fit in an `i64`.
fn key_range_end(start_key: i64, batch_count: u32, batch_size: u32) -> CoreResult<i64> {
    i64::from(batch_count)
        .checked_mul(i64::from(batch_size))
        .and_then(|total| start_key.checked_add(total))
        .ok_or_else(|| {
            CoreError::invalid_state(format!(
                "{batch_count} batches of {batch_size} keys from {start_key} overflow the key range"
            ))
        })
}

/// Adds `batch_count * batch_size` sequential keys to a dictionary, one
/// transaction per batch.
///
/// Batch `i` adds keys `start_key + i * batch_size` up to, not including,
/// `start_key + (i + 1) * batch_size`. Around every commit the committed
/// count is checked: unchanged while the batch is staged, grown by
/// `batch_size` once the commit returns. A mismatch fails with
/// `ConsistencyViolation`; batches committed before it stay committed.
///
/// Returns the final count.
pub fn populate_dictionary<V>(
    replicator: &Arc<TransactionalReplicator>,
    name: &StateProviderName,
    start_key: i64,
    batch_count: u32,
    batch_size: u32,
    value: &V,
) -> CoreResult<u64>
where
    V: Clone + Send + Sync + 'static,
{
    let end_key = key_range_end(start_key, batch_count, batch_size)?;
    let dictionary = replicator.dictionary::<i64, V>(name)?;
    let starting = dictionary.count()?;
    let size = u64::from(batch_size);
    tracing::debug!(%name, start_key, end_key, "populating dictionary");

    for batch in 0..batch_count {
        // below end_key, so no overflow
        let first = start_key + i64::from(batch) * i64::from(batch_size);
        let batch = u64::from(batch);

        let mut txn = replicator.create_transaction()?;
        for key in first..first + i64::from(batch_size) {
            dictionary.add(&mut txn, key, value.clone())?;
        }

        expect_count(
            || format!("batch {batch} before commit"),
            starting + batch * size,
            dictionary.count()?,
        )?;
        replicator.commit(&mut txn)?;
        expect_count(
            || format!("batch {batch} after commit"),
            starting + (batch + 1) * size,
            dictionary.count()?,
        )?;
        tracing::debug!(%name, batch, "batch committed");
    }

    let total = dictionary.count()?;
    expect_count(
        || "after population".to_string(),
        starting + u64::from(batch_count) * size,
        total,
    )?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcoll_core::{
        CborSerializer, OpenMode, Replica, ReplicaConfig, ServiceName, StateProviderKind,
    };
    use tempfile::tempdir;

    fn primary(path: &std::path::Path) -> (Replica, Arc<TransactionalReplicator>, StateProviderName) {
        let service = ServiceName::new("fabric:/unittest/populate").unwrap();
        let replica = Replica::with_defaults(ReplicaConfig::new(path, service)).unwrap();
        let replicator = replica.replicator();
        replicator.try_add_state_serializer::<String>(Arc::new(CborSerializer::<String>::new()));
        replica.open(OpenMode::New).unwrap();
        replica.promote().unwrap();

        let name = StateProviderName::new("urn:testDictionary").unwrap();
        replicator
            .transaction(|txn| {
                replicator.add_state_provider(txn, name.clone(), StateProviderKind::Dictionary)
            })
            .unwrap();
        (replica, replicator, name)
    }

    #[test]
    fn eight_batches_of_eight() {
        let temp = tempdir().unwrap();
        let (_replica, replicator, name) = primary(temp.path());

        let total =
            populate_dictionary(&replicator, &name, 0, 8, 8, &"value".to_string()).unwrap();
        assert_eq!(total, 64);

        let dict = replicator.dictionary::<i64, String>(&name).unwrap();
        let keys: Vec<i64> = dict.entries().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn second_run_continues_from_the_committed_count() {
        let temp = tempdir().unwrap();
        let (_replica, replicator, name) = primary(temp.path());

        populate_dictionary(&replicator, &name, 0, 2, 4, &"a".to_string()).unwrap();
        let total = populate_dictionary(&replicator, &name, 100, 3, 2, &"b".to_string()).unwrap();
        assert_eq!(total, 14);

        let dict = replicator.dictionary::<i64, String>(&name).unwrap();
        assert_eq!(dict.get(&105).unwrap(), Some("b".to_string()));
        assert_eq!(dict.get(&106).unwrap(), None);
    }

    #[test]
    fn overlapping_keys_fail_and_keep_earlier_batches() {
        let temp = tempdir().unwrap();
        let (_replica, replicator, name) = primary(temp.path());

        populate_dictionary(&replicator, &name, 0, 1, 4, &"a".to_string()).unwrap();
        let err = populate_dictionary(&replicator, &name, 2, 1, 4, &"b".to_string()).unwrap_err();
        assert!(matches!(err, CoreError::KeyExists { .. }));

        let dict = replicator.dictionary::<i64, String>(&name).unwrap();
        assert_eq!(dict.count().unwrap(), 4);
    }

    #[test]
    fn unregistered_value_type_is_reported() {
        let temp = tempdir().unwrap();
        let (_replica, replicator, name) = primary(temp.path());

        let err = populate_dictionary(&replicator, &name, 0, 1, 1, &7u32).unwrap_err();
        assert!(matches!(err, CoreError::SerializerNotRegistered { .. }));
    }

    #[test]
    fn key_range_past_i64_max_is_refused_up_front() {
        let temp = tempdir().unwrap();
        let (_replica, replicator, name) = primary(temp.path());

        let err = populate_dictionary(&replicator, &name, i64::MAX - 10, 8, 8, &"v".to_string())
            .unwrap_err();
        assert!(err.is_invalid_state());

        let dict = replicator.dictionary::<i64, String>(&name).unwrap();
        assert_eq!(dict.count().unwrap(), 0);
    }

    #[test]
    fn key_range_may_end_exactly_at_i64_max() {
        assert_eq!(key_range_end(i64::MAX - 64, 8, 8).unwrap(), i64::MAX);
        assert_eq!(key_range_end(i64::MIN, 8, 8).unwrap(), i64::MIN + 64);
        assert!(key_range_end(i64::MAX - 63, 8, 8).is_err());
    }

    #[test]
    fn count_check_reports_stage() {
        let err = expect_count(|| "batch 3 before commit".to_string(), 24, 25).unwrap_err();
        match err {
            CoreError::ConsistencyViolation {
                stage,
                expected,
                actual,
            } => {
                assert_eq!(stage, "batch 3 before commit");
                assert_eq!((expected, actual), (24, 25));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

//! Property-based test generators using proptest.
//!
//! Values are drawn from an alphabet that stresses the CSV payload and
//! wire encodings: quotes, commas, backslashes and line breaks.

use batchsync_core::csv_row;
use batchsync_protocol::{BatchStatus, ChangeRecord, DataEventType};
use proptest::prelude::*;

use crate::fixtures::DEFAULT_CHANNEL;

/// Strategy for a single column value, `None` meaning NULL.
pub fn column_value_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::weighted(
        0.9,
        prop::string::string_regex("[a-zA-Z0-9 ,\"\\\\\n\r'-]{0,24}").expect("Invalid regex"),
    )
}

/// Strategy for an `orders` row: a numeric id and a customer value.
pub fn order_row_strategy() -> impl Strategy<Value = Vec<Option<String>>> {
    (0u32..1_000_000, column_value_strategy())
        .prop_map(|(id, customer)| vec![Some(id.to_string()), customer])
}

/// Strategy for DML event types.
pub fn dml_event_strategy() -> impl Strategy<Value = DataEventType> {
    prop_oneof![
        Just(DataEventType::Insert),
        Just(DataEventType::Update),
        Just(DataEventType::Delete),
    ]
}

/// Strategy for captured `orders` changes on the default channel.
///
/// Inserts carry row data, updates carry row and key data, deletes carry
/// key data only.
pub fn order_change_strategy() -> impl Strategy<Value = ChangeRecord> {
    (dml_event_strategy(), order_row_strategy()).prop_map(|(event_type, row)| {
        let pk = csv_row(&row[..1]);
        let record = ChangeRecord::new("orders", event_type, DEFAULT_CHANNEL);
        match event_type {
            DataEventType::Insert => record.with_row_data(csv_row(&row)),
            DataEventType::Update => record.with_row_data(csv_row(&row)).with_pk_data(pk),
            _ => record.with_pk_data(pk),
        }
    })
}

/// Strategy for a sequence of captured `orders` changes.
pub fn order_changes_strategy(max: usize) -> impl Strategy<Value = Vec<ChangeRecord>> {
    prop::collection::vec(order_change_strategy(), 1..=max.max(1))
}

/// Strategy for every batch status.
pub fn batch_status_strategy() -> impl Strategy<Value = BatchStatus> {
    prop_oneof![
        Just(BatchStatus::New),
        Just(BatchStatus::Requested),
        Just(BatchStatus::Querying),
        Just(BatchStatus::Sending),
        Just(BatchStatus::Loading),
        Just(BatchStatus::Ok),
        Just(BatchStatus::Error),
        Just(BatchStatus::Ignored),
        Just(BatchStatus::Resend),
        Just(BatchStatus::LoadSetup),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn changes_carry_the_payloads_their_type_needs(record in order_change_strategy()) {
            match record.event_type {
                DataEventType::Insert => prop_assert!(record.row_data.is_some() && record.pk_data.is_none()),
                DataEventType::Update => prop_assert!(record.row_data.is_some() && record.pk_data.is_some()),
                _ => prop_assert!(record.row_data.is_none() && record.pk_data.is_some()),
            }
        }

        #[test]
        fn order_ids_are_never_null(row in order_row_strategy()) {
            prop_assert_eq!(row.len(), 2);
            prop_assert!(row[0].is_some());
        }
    }
}

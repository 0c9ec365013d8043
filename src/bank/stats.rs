use crate::bank::types::{
    parse_timestamp, SimulatedOperation, SimulationBatch, SimulationSummary, SimulationWire,
    TransactionKind,
};
use crate::error::AppError;

pub const RECENT_OPERATIONS_LIMIT: usize = 6;

/// Translates one simulation reply into a display batch. The server summary
/// wins when present; otherwise it is derived from the full operation list
/// before trimming.
pub fn summarize_batch(wire: SimulationWire) -> Result<SimulationBatch, AppError> {
    let operations = wire
        .operations
        .into_iter()
        .map(SimulatedOperation::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let summary = match wire.summary {
        Some(summary) => summary.into(),
        None => summarize(&operations),
    };

    Ok(SimulationBatch {
        summary,
        recent_operations: recent_operations(operations, RECENT_OPERATIONS_LIMIT),
    })
}

pub fn summarize(operations: &[SimulatedOperation]) -> SimulationSummary {
    if operations.is_empty() {
        return SimulationSummary::default();
    }

    let mut summary = SimulationSummary {
        total: count(operations.len()),
        min_ms: f64::INFINITY,
        ..SimulationSummary::default()
    };
    let mut total_ms = 0.0;

    for operation in operations {
        match operation.kind {
            TransactionKind::Deposit => summary.deposits += 1,
            TransactionKind::Withdrawal => summary.withdrawals += 1,
        }
        if operation.is_error() {
            summary.errors += 1;
        }
        total_ms += operation.duration_ms;
        summary.min_ms = summary.min_ms.min(operation.duration_ms);
        summary.max_ms = summary.max_ms.max(operation.duration_ms);
    }

    summary.avg_ms = total_ms / operations.len() as f64;
    summary
}

/// Newest first, at most `limit` entries. Server order is execution order; it
/// is only re-sorted when every timestamp parses.
pub fn recent_operations(
    operations: Vec<SimulatedOperation>,
    limit: usize,
) -> Vec<SimulatedOperation> {
    let parsed = operations
        .iter()
        .map(|operation| parse_timestamp(&operation.timestamp).ok())
        .collect::<Option<Vec<_>>>();

    let mut ordered: Vec<SimulatedOperation> = match parsed {
        Some(timestamps) => {
            let mut keyed: Vec<_> = timestamps.into_iter().zip(operations).collect();
            keyed.reverse();
            keyed.sort_by(|left, right| right.0.cmp(&left.0));
            keyed.into_iter().map(|(_, operation)| operation).collect()
        }
        None => operations.into_iter().rev().collect(),
    };

    ordered.truncate(limit);
    ordered
}

fn count(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::types::{SimulatedOperationWire, SimulationSummaryWire};
    use rust_decimal_macros::dec;

    fn operation(thread: &str, kind: &str, duration_ms: f64, timestamp: &str) -> SimulatedOperationWire {
        SimulatedOperationWire {
            thread: thread.to_string(),
            identity: "0000000001".to_string(),
            tipo: kind.to_string(),
            amount: dec!(10.00),
            duration_ms,
            timestamp: timestamp.to_string(),
            status: "ok".to_string(),
            message: None,
            resulting_balance: None,
        }
    }

    #[test]
    fn derives_summary_when_server_sends_none() {
        let mut failed = operation("T-3", "RETIRO", 30.0, "2024-05-01 10:00:03");
        failed.status = "error".to_string();
        failed.message = Some("Saldo insuficiente".to_string());

        let batch = summarize_batch(SimulationWire {
            summary: None,
            operations: vec![
                operation("T-1", "DEPOSITO", 10.0, "2024-05-01 10:00:01"),
                operation("T-2", "DEPOSITO", 20.0, "2024-05-01 10:00:02"),
                failed,
            ],
        })
        .expect("batch should build");

        assert_eq!(batch.summary.total, 3);
        assert_eq!(batch.summary.deposits, 2);
        assert_eq!(batch.summary.withdrawals, 1);
        assert_eq!(batch.summary.errors, 1);
        assert_eq!(batch.summary.min_ms, 10.0);
        assert_eq!(batch.summary.max_ms, 30.0);
        assert!((batch.summary.avg_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn server_summary_is_kept_verbatim() {
        let batch = summarize_batch(SimulationWire {
            summary: Some(SimulationSummaryWire {
                total: 40,
                deposits: 25,
                withdrawals: 15,
                errors: 2,
                avg_ms: 12.5,
                min_ms: 3.0,
                max_ms: 80.0,
            }),
            operations: vec![operation("T-1", "DEPOSITO", 10.0, "2024-05-01 10:00:01")],
        })
        .expect("batch should build");

        assert_eq!(batch.summary.total, 40);
        assert_eq!(batch.summary.errors, 2);
        assert_eq!(batch.recent_operations.len(), 1);
    }

    #[test]
    fn trims_to_six_newest_first() {
        let operations = (0..9)
            .map(|index| {
                operation(
                    &format!("T-{index}"),
                    "DEPOSITO",
                    5.0,
                    &format!("2024-05-01 10:00:0{index}"),
                )
            })
            .collect();

        let batch = summarize_batch(SimulationWire {
            summary: None,
            operations,
        })
        .expect("batch should build");

        assert_eq!(batch.summary.total, 9);
        assert_eq!(batch.recent_operations.len(), RECENT_OPERATIONS_LIMIT);
        assert_eq!(batch.recent_operations[0].thread, "T-8");
        assert_eq!(batch.recent_operations[5].thread, "T-3");
    }

    #[test]
    fn unparsable_timestamps_fall_back_to_reverse_server_order() {
        let operations = vec![
            SimulatedOperation::try_from(operation("T-1", "DEPOSITO", 1.0, "first"))
                .expect("valid operation"),
            SimulatedOperation::try_from(operation("T-2", "RETIRO", 1.0, "second"))
                .expect("valid operation"),
        ];

        let recent = recent_operations(operations, RECENT_OPERATIONS_LIMIT);
        assert_eq!(recent[0].thread, "T-2");
        assert_eq!(recent[1].thread, "T-1");
    }

    #[test]
    fn empty_batch_has_zeroed_summary() {
        let batch = summarize_batch(SimulationWire::default()).expect("empty batch");
        assert_eq!(batch.summary, SimulationSummary::default());
        assert!(batch.recent_operations.is_empty());
    }
}

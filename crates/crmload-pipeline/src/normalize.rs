use crmload_core::temporal::to_canonical;
use crmload_core::{Cell, RowBatch};
use tracing::warn;

/// Rewrite each temporal field into `YYYY-MM-DD HH:MM:SS`. Values that do
/// not parse become null; the second element counts them.
pub fn normalize(mut batch: RowBatch, temporal_fields: &[String]) -> (RowBatch, usize) {
    let mut coerced = 0;
    for field in temporal_fields {
        let Some(index) = batch.column_index(field) else {
            continue;
        };
        let mut nulled = 0;
        for row in &mut batch.rows {
            let Some(cell) = row.get_mut(index) else {
                continue;
            };
            let canonical = match cell {
                Cell::Null => continue,
                Cell::Text(raw) => to_canonical(raw),
                _ => None,
            };
            *cell = match canonical {
                Some(value) => Cell::Text(value),
                None => {
                    nulled += 1;
                    Cell::Null
                }
            };
        }
        if nulled > 0 {
            warn!(field = %field, nulled, "unparsable timestamps set to null");
        }
        coerced += nulled;
    }
    (batch, coerced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_fields_are_canonicalized_and_garbage_nulled() {
        let batch = RowBatch::new(
            vec!["id".into(), "created_date".into()],
            vec![
                vec![Cell::text("c1"), Cell::text("2024-03-05T10:11:12+02:00")],
                vec![Cell::text("c2"), Cell::text("03/05/2024")],
                vec![Cell::text("c3"), Cell::text("last tuesday")],
                vec![Cell::text("c4"), Cell::Null],
            ],
            0,
        );
        let (batch, coerced) = normalize(batch, &["created_date".to_string()]);

        assert_eq!(coerced, 1);
        let dates: Vec<&Cell> = batch.rows.iter().map(|r| &r[1]).collect();
        assert_eq!(
            dates,
            vec![
                &Cell::text("2024-03-05 08:11:12"),
                &Cell::text("2024-03-05 00:00:00"),
                &Cell::Null,
                &Cell::Null,
            ]
        );
        assert_eq!(batch.rows[2][0], Cell::text("c3"));
    }

    #[test]
    fn other_fields_are_left_alone() {
        let batch = RowBatch::new(
            vec!["close_date".into()],
            vec![vec![Cell::text("2024-01-01")]],
            0,
        );
        let (same, coerced) = normalize(batch.clone(), &[]);
        assert_eq!(same, batch);
        assert_eq!(coerced, 0);
    }
}

use crate::error::{DuskError, Result};

use super::{TransactLogHandler, TransactLogOp};

/// Validates that a transaction made by another process only contains
/// operations the already-open database can tolerate.
///
/// Additive, same-version schema changes (new top-level tables, new search
/// indexes, and columns added to tables created within the same transaction)
/// are safe to observe at runtime. Anything destructive invalidates every
/// outstanding handle's view and fails the replay.
#[derive(Debug, Default)]
pub struct TransactLogValidator {
    current_table: usize,
    // Tables created during the transaction being processed; these may gain
    // columns without a schema version bump.
    new_tables: Vec<usize>,
}

impl TransactLogValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_table(&self) -> usize {
        self.current_table
    }

    fn allow_if_new_table(&self) -> Result<()> {
        if self.new_tables.contains(&self.current_table) {
            Ok(())
        } else {
            Err(DuskError::SchemaMismatch)
        }
    }
}

impl TransactLogHandler for TransactLogValidator {
    fn op(&mut self, op: &TransactLogOp) -> Result<()> {
        use TransactLogOp::*;
        match op {
            SelectTable { table } => {
                self.current_table = *table;
                Ok(())
            }
            // Sub-tables are unsupported.
            SelectDescriptor { levels } => {
                if *levels == 0 {
                    Ok(())
                } else {
                    Err(DuskError::SchemaMismatch)
                }
            }

            AddSearchIndex { .. } | RemoveSearchIndex { .. } => Ok(()),

            InsertGroupLevelTable { table, .. } => {
                // Shift any previously added tables after the new one.
                for new_table in &mut self.new_tables {
                    if *new_table >= *table {
                        *new_table += 1;
                    }
                }
                self.new_tables.push(*table);
                Ok(())
            }

            InsertColumn { .. } | InsertLinkColumn { .. } | AddPrimaryKey { .. }
            | SetLinkType { .. } => self.allow_if_new_table(),

            EraseGroupLevelTable { .. }
            | RenameGroupLevelTable { .. }
            | EraseColumn { .. }
            | EraseLinkColumn { .. }
            | RenameColumn { .. }
            | RemovePrimaryKey
            | MoveColumn { .. }
            | MoveGroupLevelTable { .. } => Err(DuskError::SchemaMismatch),

            // Data mutations are unconditionally accepted.
            _ => Ok(()),
        }
    }
}

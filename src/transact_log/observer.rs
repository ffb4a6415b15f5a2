use std::collections::HashMap;

use crate::error::{DuskError, Result};
use crate::index_set::IndexSet;

use super::validator::TransactLogValidator;
use super::{TransactLogHandler, TransactLogOp};

/// Net effect of one transaction on a single table.
///
/// Row erasure uses swap-remove semantics: the erased row is replaced by the
/// table's last row, so `moves` maps each landing index to the *original*
/// index of the row now occupying it, composed across chained swaps. Rows
/// recorded in `changed` are expressed in post-transaction coordinates, with
/// swap-remapped rows resolved back to their origin.
#[derive(Debug, Default)]
pub struct ChangeInfo {
    pub deletions: usize,
    pub moves: HashMap<usize, usize>,
    pub changed: IndexSet,
}

/// Accumulated mutations of one observed link-list, identified by its
/// `(table, row, col)` coordinates.
///
/// `inserts` and `changes` are maintained in the coordinate space of the
/// final list; `deletes` holds original positions, unshifted through the
/// transaction's inserts.
#[derive(Debug)]
pub struct LinkListInfo {
    pub table: usize,
    pub row: usize,
    pub col: usize,

    pub inserts: IndexSet,
    pub deletes: IndexSet,
    pub changes: IndexSet,
    pub moves: Vec<(usize, usize)>,
    pub did_clear: bool,
}

impl LinkListInfo {
    fn new(table: usize, row: usize, col: usize) -> Self {
        Self {
            table,
            row,
            col,
            inserts: IndexSet::new(),
            deletes: IndexSet::new(),
            changes: IndexSet::new(),
            moves: Vec::new(),
            did_clear: false,
        }
    }
}

/// Condenses a transaction log into per-table change sets and per-observed
/// link-list deltas, validating schema instructions along the way.
#[derive(Debug, Default)]
pub struct TransactLogObserver {
    validator: TransactLogValidator,
    changes: Vec<ChangeInfo>,
    observed_lists: Vec<LinkListInfo>,
    // Index into `observed_lists` for the currently selected link-list.
    active_list: Option<usize>,
}

impl TransactLogObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a link-list whose mutations should be tracked.
    pub fn observe_link_list(&mut self, table: usize, row: usize, col: usize) {
        self.observed_lists.push(LinkListInfo::new(table, row, col));
    }

    pub fn changes(&self) -> &[ChangeInfo] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<ChangeInfo> {
        self.changes
    }

    pub fn link_list(&self, table: usize, row: usize, col: usize) -> Option<&LinkListInfo> {
        self.observed_lists
            .iter()
            .find(|info| info.table == table && info.row == row && info.col == col)
    }

    fn table_change(&mut self, table: usize) -> &mut ChangeInfo {
        if self.changes.len() <= table {
            let grown = (self.changes.len() * 2).max(table + 1);
            self.changes.resize_with(grown, ChangeInfo::default);
        }
        &mut self.changes[table]
    }

    fn mark_dirty(&mut self, row: usize) {
        let table = self.validator.current_table();
        let info = self.table_change(table);
        let row = info.moves.get(&row).copied().unwrap_or(row);
        info.changed.add(row);
    }

    fn erase_rows(&mut self, row: usize, count: usize, prior_rows: usize, unordered: bool) -> Result<()> {
        // The instrumented erase is always a single swap-remove.
        if !unordered || count != 1 {
            return Err(DuskError::Invalid("ordered row erasure is unsupported"));
        }
        let Some(last_row) = prior_rows.checked_sub(1) else {
            return Err(DuskError::Invalid("row erased from an empty table"));
        };
        let table = self.validator.current_table();
        let info = self.table_change(table);
        let origin = info.moves.get(&last_row).copied().unwrap_or(last_row);
        info.moves.insert(row, origin);
        info.deletions += 1;
        Ok(())
    }

    fn active_list(&mut self) -> Option<&mut LinkListInfo> {
        match self.active_list {
            Some(index) => self.observed_lists.get_mut(index),
            None => None,
        }
    }

    fn select_link_list(&mut self, col: usize, row: usize) {
        let table = self.validator.current_table();
        self.active_list = self
            .observed_lists
            .iter()
            .position(|info| info.table == table && info.row == row && info.col == col);
    }

    fn link_list_set(&mut self, index: usize) {
        if let Some(list) = self.active_list() {
            // A freshly inserted element is already reported as an insert.
            if !list.inserts.contains(index) {
                list.changes.add(index);
            }
        }
    }

    fn link_list_insert(&mut self, index: usize) {
        if let Some(list) = self.active_list() {
            list.changes.shift_for_insert_at(index);
            list.inserts.insert_at(index);
            for mv in &mut list.moves {
                if mv.1 >= index {
                    mv.1 += 1;
                }
            }
        }
    }

    fn link_list_erase(&mut self, index: usize) {
        if let Some(list) = self.active_list() {
            list.changes.erase_at(index);
            if list.inserts.contains(index) {
                // Erasing an element inserted in this same transaction cancels
                // the insert; the original list never contained it.
                list.inserts.erase_at(index);
            } else {
                let origin = list.inserts.unshift(index);
                list.inserts.erase_at(index);
                list.deletes.add_shifted(origin);
            }
            list.moves.retain(|mv| mv.1 != index);
            for mv in &mut list.moves {
                if mv.1 > index {
                    mv.1 -= 1;
                }
            }
        }
    }

    fn link_list_clear(&mut self) {
        if let Some(list) = self.active_list() {
            list.did_clear = true;
            list.changes.clear();
            list.inserts.clear();
            list.deletes.clear();
            list.moves.clear();
        }
    }

    fn link_list_move(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        if let Some(list) = self.active_list() {
            let moved_up = from < to;

            let from = list.deletes.unshift(list.inserts.unshift(from));
            list.moves.push((from, to));

            if moved_up {
                list.changes.erase_at(from);
                list.inserts.erase_at(from);
                list.deletes.add(from);

                list.changes.shift_for_insert_at(from);
                list.inserts.shift_for_insert_at(from);
            } else {
                list.changes.shift_for_insert_at(from);
                list.inserts.shift_for_insert_at(from);

                list.changes.erase_at(from);
                list.inserts.erase_at(from);
                list.deletes.add(from);
            }
        }
    }
}

impl TransactLogHandler for TransactLogObserver {
    fn op(&mut self, op: &TransactLogOp) -> Result<()> {
        use TransactLogOp::*;
        match op {
            // Cursor and schema instructions go through the validator, which
            // both tracks the table cursor and gates incompatible deltas.
            SelectTable { .. }
            | SelectDescriptor { .. }
            | AddSearchIndex { .. }
            | RemoveSearchIndex { .. }
            | InsertGroupLevelTable { .. }
            | InsertColumn { .. }
            | InsertLinkColumn { .. }
            | AddPrimaryKey { .. }
            | SetLinkType { .. }
            | EraseGroupLevelTable { .. }
            | RenameGroupLevelTable { .. }
            | EraseColumn { .. }
            | EraseLinkColumn { .. }
            | RenameColumn { .. }
            | RemovePrimaryKey
            | MoveColumn { .. }
            | MoveGroupLevelTable { .. } => self.validator.op(op),

            // Rows only ever appear at the tail; queries pick them up when
            // they re-run.
            InsertEmptyRows { .. } => Ok(()),
            EraseRows { row, count, prior_rows, unordered } => {
                self.erase_rows(*row, *count, *prior_rows, *unordered)
            }
            SwapRows { .. } | ClearTable | OptimizeTable => Ok(()),

            SetInt { row, .. }
            | SetBool { row, .. }
            | SetFloat { row, .. }
            | SetDouble { row, .. }
            | SetString { row, .. }
            | SetBinary { row, .. }
            | SetDateTime { row, .. }
            | SetTable { row, .. }
            | SetMixed { row, .. }
            | SetLink { row, .. }
            | SetNull { row, .. }
            | NullifyLink { row, .. }
            | InsertSubstring { row, .. }
            | EraseSubstring { row, .. }
            | SetIntUnique { row, .. }
            | SetStringUnique { row, .. } => {
                self.mark_dirty(*row);
                Ok(())
            }

            SelectLinkList { col, row } => {
                self.select_link_list(*col, *row);
                Ok(())
            }
            LinkListSet { index, .. } => {
                self.link_list_set(*index);
                Ok(())
            }
            LinkListInsert { index, .. } => {
                self.link_list_insert(*index);
                Ok(())
            }
            LinkListErase { index } | LinkListNullify { index } => {
                self.link_list_erase(*index);
                Ok(())
            }
            LinkListSwap { index_a, index_b } => {
                self.link_list_set(*index_a);
                self.link_list_set(*index_b);
                Ok(())
            }
            LinkListClear { .. } => {
                self.link_list_clear();
                Ok(())
            }
            LinkListMove { from, to } => {
                self.link_list_move(*from, *to);
                Ok(())
            }
        }
    }
}

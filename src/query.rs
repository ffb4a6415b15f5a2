use std::sync::Arc;

use crate::error::DuskError;
use crate::store::Snapshot;
use crate::transact_log::ChangeInfo;
use crate::types::VersionId;

/// A live query jointly owned by the coordinator and a consumer thread.
///
/// The coordinator drives the query through its lifecycle: registered at a
/// pinned version, attached to the helper snapshots while being pulled
/// forward, run against the accumulated change set, and finally handed over
/// to the consumer thread via `deliver`/`call_callbacks`.
///
/// Methods take `&self`; implementations use interior mutability since the
/// runner and consumer threads share the query.
pub trait AsyncQuery: Send + Sync {
    /// The version the query's pending results are anchored to, or `None`
    /// once a result has been handed over.
    fn version(&self) -> Option<VersionId>;

    /// Whether any consumer still wants results. Dead queries are swept at
    /// the next run.
    fn is_alive(&self) -> bool;

    /// Recomputes results against the attached snapshot. Called with the
    /// coordinator's query lock released; `changes` describes the advanced-
    /// over transactions per table.
    fn run(&self, changes: &[ChangeInfo]);

    /// Packages the results computed by `run` for adoption by a consumer
    /// thread. Called under the query lock.
    fn prepare_handover(&self);

    /// Offers the prepared results (or the sticky async error) to a consumer
    /// whose snapshot sits at the handed-over version. Returns whether the
    /// consumer accepted and `call_callbacks` should follow.
    fn deliver(&self, snapshot: &dyn Snapshot, error: Option<&Arc<DuskError>>) -> bool;

    /// Anchors the query to a helper snapshot's version.
    fn attach_to(&self, snapshot: &dyn Snapshot);

    /// Detaches from the current helper snapshot.
    fn detach(&self);

    /// Drops the underlying query object even if consumer references linger.
    fn release_query(&self);

    /// Invokes consumer callbacks for delivered results. Called with no
    /// coordinator locks held.
    fn call_callbacks(&self);
}

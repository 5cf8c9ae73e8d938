pub mod bootstrap;
pub mod error;
pub mod lookup;
pub mod model;
pub mod reclaim;
pub mod reconcile;
pub mod role_group;
pub mod search;
pub mod store;

pub use bootstrap::IdentityService;
pub use error::{IdentityError, IdentityResult};
pub use lookup::LookupKey;
pub use model::{FreedIdentifier, IdentifierKind, UserFlags, UserIdentityRecord};
pub use reclaim::{
    Degradation, FreeUpOutcome, FreeUpRequest, IdentifierReclaimer, ReclaimSettings, ReclaimStage,
};
pub use reconcile::{LookupReconciler, SweepReport};
pub use role_group::{RoleGroup, RoleGroupDao};
pub use search::{ElasticsearchIndex, InMemorySearchIndex, SearchIndex};
pub use store::{ClusterRecordStore, RecordStore};

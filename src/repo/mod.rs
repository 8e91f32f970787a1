//! Repository identity and the domain types served to the UI layer.

mod identity;
mod types;

pub use identity::{IdentityError, Provider, RepositoryIdentity};
pub use types::{BranchInfo, ConnectInfo, ContentKind, RecentRepository, TreeEntry, TreeEntryKind};

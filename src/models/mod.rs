pub mod adapter;
pub mod entry;
pub mod rule;
pub mod schema;
pub mod task;
pub mod user;

pub use adapter::{CreateAdapter, StorageAdapter, UpdateAdapter};
pub use entry::{DirEntry, EntryKind, FileMeta, PathProbe};
pub use rule::{AutomationRule, CreateRule, FsEvent, UpdateRule};
pub use schema::{ConfigField, FieldType, SelectOption};
pub use task::{Task, TaskStatus};
pub use user::User;

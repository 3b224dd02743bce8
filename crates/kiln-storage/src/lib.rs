//! Kiln Storage
//!
//! Remote collaborators of a training job:
//! - Object storage for source images/captions and produced artifacts (`ObjectStore`)
//! - A Supabase Storage REST client and a local filesystem store
//! - Best-effort HTTP callbacks (`CallbackNotifier`)

pub mod callback;
pub mod error;
pub mod local;
pub mod store;
pub mod supabase;

pub use callback::{CallbackNotifier, HttpCallbackNotifier};
pub use error::{NotifyError, StorageError, StorageResult};
pub use local::LocalObjectStore;
pub use store::{ObjectStore, content_type_for};
pub use supabase::SupabaseStorage;

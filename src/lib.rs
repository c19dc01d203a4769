//! # batonio
//!
//! An iRODS client library that drives `baton-do` worker processes.
//!
//! Each [`Client`] launches one baton-do sub-process and communicates
//! with it over stdin/stdout using a line-delimited JSON request/response
//! protocol; file contents flow through iRODS itself, not through the
//! pipe. A [`ClientPool`] multiplexes many short-lived callers onto a
//! bounded population of clients, recycling workers that are idle, old,
//! or dead.
//!
//! ## Example
//!
//! ```no_run
//! use batonio::{Args, ClientPool, ClientPoolParams, RodsItem};
//!
//! # fn main() -> batonio::Result<()> {
//! let pool = ClientPool::new(ClientPoolParams::default(), Vec::<String>::new());
//!
//! let client = pool.get()?;
//! let args = Args { contents: true, ..Args::default() };
//! let items = client.list(args, RodsItem::collection("/testZone/home/user"))?;
//! for item in &items {
//!     println!("{item}");
//! }
//! pool.return_client(client);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod envelope;
pub mod error;
pub mod item;
pub mod logging;
pub mod metadata;
pub mod pool;

pub use client::{
    BATON_EXECUTABLE, Client, DEFAULT_RESPONSE_TIMEOUT, find_and_start, find_baton,
};
pub use envelope::{Args, Envelope, ErrorMsg, MetaOperation, Operation, ResultWrapper};
pub use error::{
    BatonError, RODS_CAT_COLLECTION_NOT_EMPTY, RODS_USER_FILE_DOES_NOT_EXIST, Result, RodsError,
    is_rods_error, rods_error_code,
};
pub use item::{
    Acl, Avu, Replicate, RodsItem, Timestamp, sort_acls, sort_avus, sort_items, sort_replicates,
    sort_timestamps,
};
pub use metadata::{
    CHECKSUM_ATTR, CreationMetadataConfig, dcterms, filter_avus, make_creation_metadata,
    search_avu, set_diff_avus, set_intersect_avus, set_union_avus, uniq_avus,
};
pub use pool::{ClientPool, ClientPoolParams};

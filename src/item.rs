//! Items of the baton-do wire protocol.
//!
//! A [`RodsItem`] describes both collections and data objects in iRODS, as
//! well as local files and directories staged for upload. It is the JSON
//! document exchanged with baton-do. Which of its optional fields are
//! populated determines what kind of item it is.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::Client;
use crate::envelope::Args;
use crate::error::{BatonError, RODS_USER_FILE_DOES_NOT_EXIST, Result};
use crate::metadata::{search_avu, set_diff_avus, set_intersect_avus, set_union_avus};

/// Non-owning handle to the client that decoded an item.
///
/// Items hold a weak reference so a decoded tree never keeps its worker
/// process alive. The handle dangles once the client is dropped.
#[derive(Clone, Default)]
pub(crate) struct ClientHandle(pub(crate) Weak<Client>);

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientHandle")
    }
}

/// A collection, data object, local directory or local file, as described
/// by the baton-do JSON document.
///
/// An item may carry any of checksum, size, ACLs, AVUs, collection
/// contents, replicates and timestamps, depending on the operation that
/// produced it and the arguments it was given. A `RodsItem` is not safe
/// for concurrent use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RodsItem {
    #[serde(skip)]
    pub client: ClientHandle,

    /// Local file name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,

    /// Local directory.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub directory: Option<String>,

    /// Collection path.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub collection: Option<String>,

    /// Data object name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_object: Option<String>,

    /// Data object checksum.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checksum: Option<String>,

    /// Data object size in bytes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,

    /// Access control list.
    #[serde(rename = "access", skip_serializing_if = "Vec::is_empty", default)]
    pub acls: Vec<Acl>,

    /// Metadata AVUs.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub avus: Vec<Avu>,

    /// Collection contents.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub contents: Vec<RodsItem>,

    /// Data object replicates.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub replicates: Vec<Replicate>,

    /// Data object timestamps.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub timestamps: Vec<Timestamp>,
}

impl PartialEq for RodsItem {
    fn eq(&self, other: &Self) -> bool {
        // The client handle is transport plumbing, not item identity.
        self.file == other.file
            && self.directory == other.directory
            && self.collection == other.collection
            && self.data_object == other.data_object
            && self.checksum == other.checksum
            && self.size == other.size
            && self.acls == other.acls
            && self.avus == other.avus
            && self.contents == other.contents
            && self.replicates == other.replicates
            && self.timestamps == other.timestamps
    }
}

impl RodsItem {
    /// Create an item describing a remote collection.
    pub fn collection(path: impl Into<String>) -> Self {
        RodsItem {
            collection: Some(path.into()),
            ..RodsItem::default()
        }
    }

    /// Create an item describing a remote data object.
    pub fn data_object(path: impl Into<String>, name: impl Into<String>) -> Self {
        RodsItem {
            collection: Some(path.into()),
            data_object: Some(name.into()),
            ..RodsItem::default()
        }
    }

    /// Create an item describing a local directory.
    pub fn local_directory(dir: impl Into<String>) -> Self {
        RodsItem {
            directory: Some(dir.into()),
            ..RodsItem::default()
        }
    }

    /// Create an item describing a local file.
    pub fn local_file(dir: impl Into<String>, file: impl Into<String>) -> Self {
        RodsItem {
            directory: Some(dir.into()),
            file: Some(file.into()),
            ..RodsItem::default()
        }
    }

    /// Returns true if the item represents a collection.
    pub fn is_collection(&self) -> bool {
        self.data_object.is_none() && self.collection.is_some()
    }

    /// Returns true if the item represents a data object.
    pub fn is_data_object(&self) -> bool {
        self.data_object.is_some()
    }

    /// Returns true if the item represents a local directory.
    pub fn is_local_dir(&self) -> bool {
        self.file.is_none() && self.directory.is_some()
    }

    /// Returns true if the item represents a local file.
    pub fn is_local_file(&self) -> bool {
        self.file.is_some()
    }

    /// The cleaned path of the item in iRODS, if it has one.
    pub fn rods_path(&self) -> Option<PathBuf> {
        if self.is_collection() {
            self.collection.as_ref().map(|p| clean_path(Path::new(p)))
        } else if self.is_data_object() {
            let mut path = PathBuf::from(self.collection.as_deref().unwrap_or(""));
            path.push(self.data_object.as_deref().unwrap_or(""));
            Some(clean_path(&path))
        } else {
            None
        }
    }

    /// The cleaned local path of the item, if it has one.
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.is_local_file() {
            let mut path = PathBuf::from(self.directory.as_deref().unwrap_or(""));
            path.push(self.file.as_deref().unwrap_or(""));
            Some(clean_path(&path))
        } else if self.is_local_dir() {
            self.directory.as_ref().map(|d| clean_path(Path::new(d)))
        } else {
            None
        }
    }

    /// The metadata AVUs cached on the item. Does not contact the server;
    /// see [`RodsItem::fetch_metadata`].
    pub fn metadata(&self) -> &[Avu] {
        &self.avus
    }

    /// Returns true if the item has the argument AVU in its cached
    /// metadata.
    pub fn has_metadatum(&self, avu: &Avu) -> bool {
        self.avus.iter().any(|a| a == avu)
    }

    /// Returns true if the item has at least one of the argument AVUs in
    /// its cached metadata.
    pub fn has_some_metadata(&self, avus: &[Avu]) -> bool {
        let lookup: HashSet<&Avu> = self.avus.iter().collect();
        avus.iter().any(|avu| lookup.contains(avu))
    }

    /// Returns true if the item has every one of the argument AVUs in its
    /// cached metadata.
    pub fn has_all_metadata(&self, avus: &[Avu]) -> bool {
        let lookup: HashSet<&Avu> = self.avus.iter().collect();
        avus.iter().all(|avu| lookup.contains(avu))
    }

    /// Returns true if the item exists in iRODS, or false otherwise.
    pub fn exists(&self) -> Result<bool> {
        match self.client()?.list_item(Args::default(), self.clone()) {
            Ok(_) => Ok(true),
            Err(err) if err.rods_error_code() == Some(RODS_USER_FILE_DOES_NOT_EXIST) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Fetch the ACLs on the item from the server, caching them on the
    /// item.
    pub fn fetch_acls(&mut self) -> Result<Vec<Acl>> {
        let acl_args = Args {
            acl: true,
            ..Args::default()
        };
        let it = self.client()?.list_item(acl_args, self.clone())?;
        self.acls = it.acls;

        Ok(self.acls.clone())
    }

    /// Add the argument ACLs to the item, then refresh the cached ACLs.
    pub fn add_acls(&mut self, acls: Vec<Acl>) -> Result<()> {
        let mut it = self.clone();
        it.acls = acls;
        self.client()?.chmod(Args::default(), it)?;

        self.fetch_acls()?;
        Ok(())
    }

    /// Fetch the metadata AVUs on the item from the server, caching them
    /// on the item.
    pub fn fetch_metadata(&mut self) -> Result<Vec<Avu>> {
        let avu_args = Args {
            avu: true,
            ..Args::default()
        };
        let it = self.client()?.list_item(avu_args, self.clone())?;
        self.avus = it.avus;

        Ok(self.avus.clone())
    }

    /// Add each argument AVU to the item. The operation is idempotent;
    /// AVUs already present are not sent again.
    pub fn add_metadata(&mut self, avus: &[Avu]) -> Result<()> {
        let current = self.fetch_metadata()?;

        let to_add = set_diff_avus(avus, &current);
        if !to_add.is_empty() {
            let mut it = self.clone();
            it.avus = to_add.clone();
            self.client()?.meta_add(Args::default(), it)?;

            self.avus = set_union_avus(&current, &to_add);
        }

        Ok(())
    }

    /// Remove each argument AVU from the item. The operation is
    /// idempotent; removing an AVU that is not present is not an error.
    pub fn remove_metadata(&mut self, avus: &[Avu]) -> Result<()> {
        let current = self.fetch_metadata()?;

        let mut it = self.clone();
        it.avus = avus.to_vec();
        self.client()?.meta_rem(Args::default(), it)?;

        self.avus = set_diff_avus(&current, avus);

        Ok(())
    }

    /// Remove from the item any existing AVUs sharing an attribute with
    /// the argument AVUs, then add the argument AVUs. AVUs common to both
    /// sets are left in place.
    pub fn replace_metadata(&mut self, avus: &[Avu]) -> Result<()> {
        let rep_attrs: HashSet<&str> = avus.iter().map(|avu| avu.attribute.as_str()).collect();

        let current = self.fetch_metadata()?;

        let to_keep = set_intersect_avus(avus, &current);

        let to_remove: Vec<Avu> = current
            .iter()
            .filter(|avu| {
                rep_attrs.contains(avu.attribute.as_str()) && !search_avu(avu, &to_keep)
            })
            .cloned()
            .collect();

        let to_add = set_diff_avus(avus, &to_keep);

        debug!(path = %self, avus = ?to_remove, "removing AVUs");
        if !to_remove.is_empty() {
            let mut rem = self.clone();
            rem.avus = to_remove.clone();
            self.client()?.meta_rem(Args::default(), rem)?;
        }

        debug!(path = %self, avus = ?to_keep, "keeping AVUs");
        debug!(path = %self, avus = ?to_add, "adding AVUs");
        if !to_add.is_empty() {
            let mut add = self.clone();
            add.avus = to_add.clone();
            self.client()?.meta_add(Args::default(), add)?;
        }

        // Update the cache from what was sent, saving a trip to the
        // server.
        self.avus = set_union_avus(&to_add, &set_diff_avus(&current, &to_remove));

        Ok(())
    }

    /// The client that decoded this item.
    pub(crate) fn client(&self) -> Result<Arc<Client>> {
        self.client.0.upgrade().ok_or(BatonError::Detached)
    }

    /// Wire the item, and everything beneath it, to the client that
    /// decoded it.
    pub(crate) fn attach(&mut self, client: &Arc<Client>) {
        self.client = ClientHandle(Arc::downgrade(client));
        for item in &mut self.contents {
            item.attach(client);
        }
    }
}

impl fmt::Display for RodsItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = self.rods_path().or_else(|| self.local_path()) {
            write!(f, "{}", path.display())
        } else {
            Ok(())
        }
    }
}

/// An access control entry. The owner may be a user or, more often, a
/// data access group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    /// The iRODS group (or user).
    pub owner: String,
    /// The iRODS access level (null, read, own etc).
    pub level: String,
    /// The iRODS zone.
    pub zone: String,
}

/// An iRODS attribute, value, units metadata triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Avu {
    /// iRODS attribute name.
    pub attribute: String,
    /// iRODS attribute value.
    pub value: String,
    /// iRODS attribute units.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub units: Option<String>,
    /// Query operator, used by metadata queries.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operator: Option<String>,
}

impl Avu {
    /// Create an AVU with no units.
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Avu {
            attribute: attribute.into(),
            value: value.into(),
            units: None,
            operator: None,
        }
    }

    /// Set the units of the AVU.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Set the query operator of the AVU.
    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    /// Returns true if the AVU attribute has a colon-separated namespace.
    pub fn has_namespace(&self) -> bool {
        self.attribute.find(':').is_some_and(|i| i > 0)
    }

    /// The namespace of the AVU attribute, or an empty string if there is
    /// none.
    pub fn namespace(&self) -> &str {
        if self.has_namespace() {
            self.attribute.split(':').next().unwrap_or("")
        } else {
            ""
        }
    }

    /// Returns a copy of the AVU with the attribute namespace set, unless
    /// it is already present.
    pub fn with_namespace(&self, namespace: &str) -> Avu {
        let prefix = format!("{namespace}:");

        let mut avu = self.clone();
        if !avu.attribute.starts_with(&prefix) {
            avu.attribute = format!("{prefix}{}", avu.attribute);
        }
        avu
    }

    /// The attribute of the AVU without its namespace, if one is present.
    pub fn without_namespace(&self) -> &str {
        if self.has_namespace() {
            self.attribute.splitn(2, ':').nth(1).unwrap_or("")
        } else {
            &self.attribute
        }
    }
}

/// A physical copy of a data object at a specific resource and location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replicate {
    /// The resource name where the replicate is located.
    pub resource: String,
    /// The server where the replicate is located.
    pub location: String,
    /// The checksum of the replicate.
    pub checksum: String,
    /// The iRODS replicate number.
    #[serde(alias = "replicate")]
    pub number: u32,
    /// Whether the replicate is up-to-date.
    pub valid: bool,
}

/// Creation and modification times of a data object replicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Creation time of the replicate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created: Option<DateTime<Utc>>,
    /// Modification time of the replicate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub modified: Option<DateTime<Utc>>,
    /// The replicate number the timestamp refers to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub replicates: Option<u32>,
}

/// Sort items in place: collections before data objects, then by
/// collection path, then data objects of equal path by name. The sort is
/// stable.
pub fn sort_items(items: &mut [RodsItem]) {
    items.sort_by(cmp_items);
}

fn cmp_items(a: &RodsItem, b: &RodsItem) -> Ordering {
    match (a.is_collection(), b.is_collection()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => a.collection.cmp(&b.collection),
        (false, false) => {
            if a.collection == b.collection {
                a.data_object.cmp(&b.data_object)
            } else {
                a.collection.cmp(&b.collection)
            }
        }
    }
}

/// Sort AVUs in place by attribute, then value, then units. The sort is
/// stable.
pub fn sort_avus(avus: &mut [Avu]) {
    avus.sort_by(cmp_avus);
}

fn cmp_avus(a: &Avu, b: &Avu) -> Ordering {
    a.attribute
        .cmp(&b.attribute)
        .then_with(|| a.value.cmp(&b.value))
        .then_with(|| a.units.cmp(&b.units))
}

/// Sort ACLs in place by zone, then owner, then level. The sort is
/// stable.
pub fn sort_acls(acls: &mut [Acl]) {
    acls.sort_by(cmp_acls);
}

fn cmp_acls(a: &Acl, b: &Acl) -> Ordering {
    a.zone
        .cmp(&b.zone)
        .then_with(|| a.owner.cmp(&b.owner))
        .then_with(|| a.level.cmp(&b.level))
}

/// Sort replicates in place by resource, location, number and checksum,
/// with valid replicates before invalid when all else ties. The sort is
/// stable.
pub fn sort_replicates(replicates: &mut [Replicate]) {
    replicates.sort_by(cmp_replicates);
}

fn cmp_replicates(a: &Replicate, b: &Replicate) -> Ordering {
    a.resource
        .cmp(&b.resource)
        .then_with(|| a.location.cmp(&b.location))
        .then_with(|| a.number.cmp(&b.number))
        .then_with(|| a.checksum.cmp(&b.checksum))
        .then_with(|| b.valid.cmp(&a.valid))
}

/// Sort timestamps in place by replicate number, then created time (a
/// present time before an absent one), then modified time likewise. The
/// sort is stable.
pub fn sort_timestamps(timestamps: &mut [Timestamp]) {
    timestamps.sort_by(cmp_timestamps);
}

fn cmp_timestamps(a: &Timestamp, b: &Timestamp) -> Ordering {
    a.replicates
        .unwrap_or(0)
        .cmp(&b.replicates.unwrap_or(0))
        .then_with(|| cmp_times(&a.created, &b.created))
        .then_with(|| cmp_times(&a.modified, &b.modified))
}

fn cmp_times(a: &Option<DateTime<Utc>>, b: &Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Lexically clean a path: collapses repeated separators and removes `.`
/// components.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let cleaned: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

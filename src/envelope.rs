//! The baton-do wire envelope.
//!
//! Requests and responses are single JSON objects, newline-delimited on
//! the worker's stdio. A request names an operation, its arguments and a
//! target item; the response returns the same document with exactly one
//! of a result or an error filled in.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::error::{BatonError, Result, RodsError};
use crate::item::{RodsItem, sort_acls, sort_avus, sort_items, sort_timestamps};

/// A baton-do operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Mkdir,
    Put,
    Get,
    Remove,
    Rmdir,
    Chmod,
    Checksum,
    Metamod,
    Metaquery,
}

impl Operation {
    /// The wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Mkdir => "mkdir",
            Operation::Put => "put",
            Operation::Get => "get",
            Operation::Remove => "remove",
            Operation::Rmdir => "rmdir",
            Operation::Chmod => "chmod",
            Operation::Checksum => "checksum",
            Operation::Metamod => "metamod",
            Operation::Metaquery => "metaquery",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The sub-operation of a metamod request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaOperation {
    Add,
    Rem,
}

/// Arguments for the various baton-do operation parameters. Flags that
/// are unset are omitted from the wire document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    /// Request a metadata sub-operation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation: Option<MetaOperation>,
    /// Request ACLs.
    #[serde(skip_serializing_if = "is_false", default)]
    pub acl: bool,
    /// Request metadata AVUs.
    #[serde(skip_serializing_if = "is_false", default)]
    pub avu: bool,
    /// Request checksums.
    #[serde(skip_serializing_if = "is_false", default)]
    pub checksum: bool,
    /// Restrict to collections.
    #[serde(skip_serializing_if = "is_false", default)]
    pub collection: bool,
    /// Request collection contents.
    #[serde(skip_serializing_if = "is_false", default)]
    pub contents: bool,
    /// Force an operation.
    #[serde(skip_serializing_if = "is_false", default)]
    pub force: bool,
    /// Restrict to data objects.
    #[serde(skip_serializing_if = "is_false", default)]
    pub object: bool,
    /// Request a recursive operation.
    #[serde(skip_serializing_if = "is_false", default)]
    pub recurse: bool,
    /// Request replicate information.
    #[serde(skip_serializing_if = "is_false", default)]
    pub replicate: bool,
    /// Request data object size.
    #[serde(skip_serializing_if = "is_false", default)]
    pub size: bool,
    /// Request timestamps.
    #[serde(skip_serializing_if = "is_false", default)]
    pub timestamp: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The result of an operation: a single item or an ordered list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultWrapper {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub single: Option<RodsItem>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub multiple: Option<Vec<RodsItem>>,
}

/// An in-band error reported by baton-do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub message: String,
    pub code: i32,
}

/// The JSON document accepted by baton-do, describing an operation to
/// perform on a target. It is also the document returned afterwards,
/// describing the outcome, including any return value and errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Operation for baton-do.
    pub operation: Operation,
    /// Arguments for the operation.
    pub arguments: Args,
    /// Target of the operation.
    pub target: RodsItem,
    /// Result of the operation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<ResultWrapper>,
    /// Error from the operation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorMsg>,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(operation: Operation, arguments: Args, target: RodsItem) -> Self {
        Envelope {
            operation,
            arguments,
            target,
            result: None,
            error: None,
        }
    }

    /// Serialize to a single JSON line, without the trailing newline.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }

    /// Unwrap a response envelope into its items, normalized and wired to
    /// the client that received them.
    ///
    /// Exactly one of the result and error fields must be present. An
    /// in-band error becomes a [`BatonError::Rods`] tagged with the
    /// operation.
    pub fn into_items(self, client: &Arc<Client>) -> Result<Vec<RodsItem>> {
        if let Some(error) = self.error {
            if self.result.is_some() {
                return Err(BatonError::MalformedEnvelope {
                    operation: self.operation,
                    reason: "both result and error present".to_string(),
                });
            }

            return Err(BatonError::Rods {
                operation: self.operation,
                source: RodsError {
                    message: error.message,
                    code: error.code,
                },
            });
        }

        let result = self.result.ok_or_else(|| BatonError::MalformedEnvelope {
            operation: self.operation,
            reason: "no result".to_string(),
        })?;

        let mut items = match (result.single, result.multiple) {
            (None, Some(list)) => list,
            (Some(item), None) => vec![item],
            _ => {
                return Err(BatonError::MalformedEnvelope {
                    operation: self.operation,
                    reason: "result has no content".to_string(),
                });
            }
        };

        sort_items(&mut items);
        for item in &mut items {
            normalize(item);
            item.attach(client);
        }

        Ok(items)
    }
}

/// Put an item's sortable fields into their canonical orders, through any
/// nested contents.
fn normalize(item: &mut RodsItem) {
    sort_avus(&mut item.avus);
    sort_acls(&mut item.acls);
    sort_timestamps(&mut item.timestamps);
    sort_items(&mut item.contents);
    for child in &mut item.contents {
        normalize(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Acl, Avu};

    #[test]
    fn test_request_round_trip() {
        let args = Args {
            operation: Some(MetaOperation::Add),
            avu: true,
            contents: true,
            ..Args::default()
        };
        let target = RodsItem {
            collection: Some("/testZone/home/user".to_string()),
            avus: vec![Avu::new("a", "1")],
            ..RodsItem::default()
        };
        let envelope = Envelope::request(Operation::Metamod, args, target);

        let line = envelope.to_line().unwrap();
        let parsed = Envelope::from_line(&line).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_request_omits_unset_flags() {
        let args = Args {
            force: true,
            ..Args::default()
        };
        let envelope = Envelope::request(
            Operation::Rmdir,
            args,
            RodsItem::collection("/testZone/home/user"),
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["operation"], "rmdir");
        assert_eq!(json["arguments"]["force"], true);
        assert!(json["arguments"].get("recurse").is_none());
        assert!(json["arguments"].get("operation").is_none());
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_decode_result_single() {
        let line = br#"{"operation":"mkdir","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/c"}}}"#;
        let envelope = Envelope::from_line(line).unwrap();
        let result = envelope.result.unwrap();
        assert_eq!(
            result.single.unwrap().collection.as_deref(),
            Some("/testZone/c")
        );
    }

    #[test]
    fn test_decode_error() {
        let line = br#"{"operation":"list","arguments":{},"target":{},"error":{"message":"does not exist","code":-310000}}"#;
        let envelope = Envelope::from_line(line).unwrap();
        let error = envelope.error.unwrap();
        assert_eq!(error.code, -310000);
        assert_eq!(error.message, "does not exist");
    }

    #[test]
    fn test_sub_operation_wire_names() {
        let add = serde_json::to_string(&MetaOperation::Add).unwrap();
        assert_eq!(add, r#""add""#);
        let rem = serde_json::to_string(&MetaOperation::Rem).unwrap();
        assert_eq!(rem, r#""rem""#);
    }

    #[test]
    fn test_operation_wire_names() {
        for (op, name) in [
            (Operation::List, "list"),
            (Operation::Mkdir, "mkdir"),
            (Operation::Put, "put"),
            (Operation::Get, "get"),
            (Operation::Remove, "remove"),
            (Operation::Rmdir, "rmdir"),
            (Operation::Chmod, "chmod"),
            (Operation::Checksum, "checksum"),
            (Operation::Metamod, "metamod"),
            (Operation::Metaquery, "metaquery"),
        ] {
            assert_eq!(serde_json::to_string(&op).unwrap(), format!("\"{name}\""));
            assert_eq!(op.as_str(), name);
        }
    }

    #[test]
    fn test_acl_wire_names() {
        let acl = Acl {
            owner: "user".to_string(),
            level: "own".to_string(),
            zone: "testZone".to_string(),
        };
        let json = serde_json::to_value(&acl).unwrap();
        assert_eq!(json["owner"], "user");
        assert_eq!(json["level"], "own");
        assert_eq!(json["zone"], "testZone");
    }
}

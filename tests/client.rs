//! Integration tests for the client supervisor and dispatcher, driven by
//! scripted stand-ins for baton-do.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use batonio::{
    Args, BatonError, Client, RODS_CAT_COLLECTION_NOT_EMPTY, RODS_USER_FILE_DOES_NOT_EXIST,
    RodsItem, find_and_start, find_baton, is_rods_error, rods_error_code,
};
use tempfile::TempDir;

use common::{OK_EMPTY_LIST, install_baton_on_path, responder_body, write_baton_script};

/// Start a client running a scripted stand-in, with a short response
/// timeout so re-arm paths are exercised quickly.
fn start_scripted(body: &str) -> (TempDir, Arc<Client>) {
    install_baton_on_path();

    let dir = tempfile::tempdir().expect("failed to create script dir");
    let script = write_baton_script(dir.path(), body);

    let client = Client::new(script)
        .expect("failed to create client")
        .with_response_timeout(Duration::from_millis(100));
    let client = Arc::new(client);
    client
        .start(Vec::<String>::new())
        .expect("failed to start client");

    (dir, client)
}

#[test]
fn test_discover_and_start() {
    install_baton_on_path();

    let baton = find_baton().expect("baton-do not found on PATH");
    assert!(baton.is_absolute());
    assert_eq!(baton.file_name().unwrap(), "baton-do");

    let client = find_and_start(Vec::<String>::new()).expect("failed to start");
    assert!(client.is_running());
    assert!(client.pid() > 0);

    client.stop().expect("failed to stop");
    assert!(!client.is_running());
}

#[test]
fn test_list_nonexistent_target() {
    let body = r#"while IFS= read -r line; do
  printf '%s\n' '{"operation":"list","arguments":{},"target":{},"error":{"message":"Path does not exist","code":-310000}}'
done"#;
    let (_dir, client) = start_scripted(body);

    let err = client
        .list(Args::default(), RodsItem::collection("/testZone/no_such"))
        .expect_err("list should fail");

    assert!(is_rods_error(&err));
    assert_eq!(rods_error_code(&err), Some(RODS_USER_FILE_DOES_NOT_EXIST));

    client.stop().expect("failed to stop");
}

#[test]
fn test_remove_nonempty_collection() {
    let body = r#"while IFS= read -r line; do
  case "$line" in
    *'"operation":"rmdir"'*'"recurse":true'*)
      printf '%s\n' '{"operation":"rmdir","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/c"}}}'
      ;;
    *'"operation":"rmdir"'*)
      printf '%s\n' '{"operation":"rmdir","arguments":{},"target":{},"error":{"message":"SYS_COLLECTION_NOT_EMPTY","code":-821000}}'
      ;;
    *)
      printf '%s\n' '{"operation":"list","arguments":{},"target":{},"error":{"message":"Path does not exist","code":-310000}}'
      ;;
  esac
done"#;
    let (_dir, client) = start_scripted(body);

    let err = client
        .remove_dir(Args::default(), RodsItem::collection("/testZone/c"))
        .expect_err("rmdir of a non-empty collection should fail");
    assert_eq!(rods_error_code(&err), Some(RODS_CAT_COLLECTION_NOT_EMPTY));

    let recurse_args = Args {
        recurse: true,
        ..Args::default()
    };
    let removed = client
        .remove_dir(recurse_args, RodsItem::collection("/testZone/c"))
        .expect("recursive rmdir should succeed");
    assert_eq!(removed.len(), 1);

    // The returned item is wired back to the client, so follow-up calls
    // work without threading the client handle through.
    let gone = &removed[0];
    assert!(!gone.exists().expect("exists check failed"));

    client.stop().expect("failed to stop");
}

#[test]
fn test_list_contents_ordering() {
    // Contents arrive with the data object first and everything else
    // unsorted; the codec must deliver collection-before-object, then
    // path-ascending, and sorted AVUs and ACLs.
    let body = r#"while IFS= read -r line; do
  printf '%s\n' '{"operation":"list","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/c","contents":[{"collection":"/testZone/c","data_object":"b"},{"collection":"/testZone/c/a"}],"avus":[{"attribute":"b","value":"2"},{"attribute":"a","value":"1"}],"access":[{"owner":"public","level":"read","zone":"testZone"},{"owner":"admin","level":"own","zone":"testZone"}]}}}'
done"#;
    let (_dir, client) = start_scripted(body);

    let contents_args = Args {
        contents: true,
        ..Args::default()
    };
    let items = client
        .list(contents_args, RodsItem::collection("/testZone/c"))
        .expect("list failed");
    assert_eq!(items.len(), 1);

    let listing = &items[0];
    assert_eq!(listing.contents.len(), 2);
    assert!(listing.contents[0].is_collection());
    assert_eq!(
        listing.contents[0].collection.as_deref(),
        Some("/testZone/c/a")
    );
    assert!(listing.contents[1].is_data_object());
    assert_eq!(listing.contents[1].data_object.as_deref(), Some("b"));

    assert_eq!(listing.avus[0].attribute, "a");
    assert_eq!(listing.avus[1].attribute, "b");
    assert_eq!(listing.acls[0].owner, "admin");
    assert_eq!(listing.acls[1].owner, "public");

    client.stop().expect("failed to stop");
}

#[test]
fn test_responses_paired_fifo() {
    // Each response is numbered by arrival, so a mismatched pairing
    // would be visible in the returned paths.
    let body = r#"n=0
while IFS= read -r line; do
  n=$((n+1))
  printf '{"operation":"list","arguments":{},"target":{},"result":{"multiple":[{"collection":"/testZone/c%s"}]}}\n' "$n"
done"#;
    let (_dir, client) = start_scripted(body);

    for i in 1..=5 {
        let items = client
            .list(Args::default(), RodsItem::collection("/testZone/c"))
            .expect("list failed");
        assert_eq!(
            items[0].collection.as_deref(),
            Some(format!("/testZone/c{i}").as_str())
        );
    }

    client.stop().expect("failed to stop");
}

#[test]
fn test_slow_response_waits_past_timeout() {
    let body = format!(
        "while IFS= read -r line; do\n  sleep 1\n  printf '%s\\n' '{OK_EMPTY_LIST}'\ndone"
    );
    let (_dir, client) = start_scripted(&body);

    // The response timeout is 100 ms; the worker takes ~1 s. The wait is
    // re-armed while the worker lives, so the call succeeds.
    let begin = Instant::now();
    let items = client
        .list(Args::default(), RodsItem::collection("/testZone/c"))
        .expect("a slow response should still be delivered");
    assert!(items.is_empty());
    assert!(begin.elapsed() >= Duration::from_millis(900));

    client.stop().expect("failed to stop");
}

#[test]
fn test_receive_fails_when_worker_dies() {
    let body = "IFS= read -r line\nexit 0";
    let (_dir, client) = start_scripted(body);

    let err = client
        .list(Args::default(), RodsItem::collection("/testZone/c"))
        .expect_err("a dead worker must not wedge the caller");
    assert!(matches!(err, BatonError::ReceiveFailed));

    // stop() waits for the supervisor to finish its bookkeeping.
    client.stop().expect("a clean exit is not a stop error");
    assert!(!client.is_running());
}

#[test]
fn test_stop_captures_exit_failure() {
    let body = "while IFS= read -r line; do :; done\nexit 3";
    let (_dir, client) = start_scripted(body);

    let first = client.stop().expect_err("exit 3 should surface");
    let second = client.stop().expect_err("stop is idempotent");
    assert_eq!(first.to_string(), second.to_string());
    assert!(matches!(first, BatonError::Exited(_)));
}

#[test]
fn test_meta_add_and_rem_sub_operations() {
    let body = r#"while IFS= read -r line; do
  case "$line" in
    *'"arguments":{"operation":"add"'*)
      printf '%s\n' '{"operation":"metamod","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/c","avus":[{"attribute":"added","value":"1"}]}}}'
      ;;
    *'"arguments":{"operation":"rem"'*)
      printf '%s\n' '{"operation":"metamod","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/c"}}}'
      ;;
    *)
      printf '%s\n' '{"operation":"list","arguments":{},"target":{},"result":{"multiple":[]}}'
      ;;
  esac
done"#;
    let (_dir, client) = start_scripted(body);

    let target = RodsItem {
        collection: Some("/testZone/c".to_string()),
        avus: vec![batonio::Avu::new("added", "1")],
        ..RodsItem::default()
    };

    let added = client
        .meta_add(Args::default(), target.clone())
        .expect("meta_add failed");
    assert_eq!(added.avus.len(), 1);
    assert_eq!(added.avus[0].attribute, "added");

    let removed = client
        .meta_rem(Args::default(), target)
        .expect("meta_rem failed");
    assert!(removed.avus.is_empty());

    client.stop().expect("failed to stop");
}

#[test]
fn test_add_metadata_is_idempotent() {
    // The stand-in rejects every metamod, so an add that is already
    // satisfied must never reach the worker.
    let body = r#"while IFS= read -r line; do
  case "$line" in
    *'"operation":"metamod"'*)
      printf '%s\n' '{"operation":"metamod","arguments":{},"target":{},"error":{"message":"unexpected metamod","code":-1}}'
      ;;
    *)
      printf '%s\n' '{"operation":"list","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/c","avus":[{"attribute":"a","value":"1"}]}}}'
      ;;
  esac
done"#;
    let (_dir, client) = start_scripted(body);

    let mut item = client
        .list_item(Args::default(), RodsItem::collection("/testZone/c"))
        .expect("list_item failed");

    item.add_metadata(&[batonio::Avu::new("a", "1")])
        .expect("an add with nothing new should not reach the worker");
    assert!(item.has_metadatum(&batonio::Avu::new("a", "1")));

    let err = item
        .add_metadata(&[batonio::Avu::new("b", "2")])
        .expect_err("a genuinely new AVU is sent, and here rejected");
    assert!(is_rods_error(&err));

    client.stop().expect("failed to stop");
}

#[test]
fn test_meta_query_requires_target_kind() {
    let (_dir, client) = start_scripted(&responder_body());

    let err = client
        .meta_query(Args::default(), RodsItem::default())
        .expect_err("metaquery without object/collection should fail");
    assert!(matches!(err, BatonError::InvalidArgument(_)));

    let object_args = Args {
        object: true,
        ..Args::default()
    };
    let items = client
        .meta_query(object_args, RodsItem::default())
        .expect("metaquery failed");
    assert!(items.is_empty());

    client.stop().expect("failed to stop");
}

#[test]
fn test_list_item_rejections() {
    let (_dir, client) = start_scripted(&responder_body());

    let recurse_args = Args {
        recurse: true,
        ..Args::default()
    };
    let err = client
        .list_item(recurse_args, RodsItem::collection("/testZone/c"))
        .expect_err("recurse is not permitted");
    assert!(matches!(err, BatonError::InvalidArgument(_)));

    // The stand-in returns an empty list for everything.
    let err = client
        .list_item(Args::default(), RodsItem::collection("/testZone/c"))
        .expect_err("an empty result is not a single item");
    assert!(matches!(err, BatonError::NotFound(_)));

    client.stop().expect("failed to stop");
}

#[test]
fn test_put_recurse_uploads_tree() {
    let body = r#"n=0
while IFS= read -r line; do
  case "$line" in
    *'"operation":"mkdir"'*)
      printf '%s\n' '{"operation":"mkdir","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/dst"}}}'
      ;;
    *'"operation":"put"'*)
      n=$((n+1))
      printf '{"operation":"put","arguments":{},"target":{},"result":{"single":{"collection":"/testZone/dst","data_object":"f%s.txt"}}}\n' "$n"
      ;;
    *)
      printf '%s\n' '{"operation":"list","arguments":{},"target":{},"result":{"multiple":[]}}'
      ;;
  esac
done"#;
    let (_dir, client) = start_scripted(body);

    let stage = tempfile::tempdir().expect("failed to create staging dir");
    std::fs::create_dir(stage.path().join("sub")).unwrap();
    std::fs::write(stage.path().join("f1.txt"), "one").unwrap();
    std::fs::write(stage.path().join("sub/f2.txt"), "two").unwrap();

    let target = RodsItem {
        directory: Some(stage.path().to_string_lossy().into_owned()),
        collection: Some("/testZone/dst".to_string()),
        ..RodsItem::default()
    };
    let recurse_args = Args {
        recurse: true,
        ..Args::default()
    };
    let put = client.put(recurse_args, target).expect("put failed");

    assert_eq!(put.len(), 2);
    assert_eq!(put[0].data_object.as_deref(), Some("f1.txt"));
    assert_eq!(put[1].data_object.as_deref(), Some("f2.txt"));

    client.stop().expect("failed to stop");
}

#[test]
fn test_put_recurse_argument_checks() {
    let (_dir, client) = start_scripted(&responder_body());

    let recurse_args = Args {
        recurse: true,
        ..Args::default()
    };

    // A local file target is not a directory.
    let not_dir = RodsItem {
        directory: Some("/tmp".to_string()),
        file: Some("x".to_string()),
        ..RodsItem::default()
    };
    let err = client
        .put(recurse_args.clone(), not_dir)
        .expect_err("a bare local file has no remote target");
    assert!(matches!(err, BatonError::InvalidArgument(_)));

    // A local directory needs a collection to land in.
    let no_coll = RodsItem {
        directory: Some("/tmp".to_string()),
        ..RodsItem::default()
    };
    let err = client
        .put(recurse_args, no_coll)
        .expect_err("a directory upload needs a collection");
    assert!(matches!(err, BatonError::InvalidArgument(_)));

    client.stop().expect("failed to stop");
}

use std::collections::BTreeMap;
use std::sync::Arc;

use promptgrid::cache::{CacheMap, KeyValueStore, ResponseCache, SqliteStore};
use promptgrid::gateway::Message;
use promptgrid::{LlmOutput, ResponseObject};
use serde_json::json;
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key: String,
    value: serde_json::Value,
    created_at: i64,
    updated_at: i64,
}

fn response(prompt: &str, history: Option<Vec<Message>>, outputs: &[&str]) -> ResponseObject {
    ResponseObject {
        uid: format!("{prompt}-{}", outputs.len()),
        prompt: prompt.to_string(),
        query: json!({"prompt": prompt}),
        responses: outputs.iter().map(|o| LlmOutput::from(*o)).collect(),
        raw_response: Some(json!({"choices": []})),
        llm: "gpt-test".to_string(),
        vars: BTreeMap::from([("topic".to_string(), prompt.to_string())]),
        metavars: BTreeMap::new(),
        chat_history: history,
    }
}

#[test]
fn response_cache_survives_reopening_the_database() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("nested").join("cache.sqlite");

    let mut map = CacheMap::new();
    map.upsert(response("bees", None, &["buzz"]));
    map.upsert(response("bees", Some(vec![Message::system("be brief")]), &["b"]));
    map.upsert(response("ants", None, &["march", "march"]));

    {
        let store = SqliteStore::new(&db_path).unwrap();
        let cache = ResponseCache::new(Arc::new(store), Some("flow-1".into()));
        cache.store(&map).unwrap();
    }

    let store = Arc::new(SqliteStore::new(&db_path).unwrap());
    let reopened = ResponseCache::new(store.clone(), Some("flow-1".into())).load();
    assert_eq!(reopened, map);

    let other_key = ResponseCache::new(store, Some("flow-2".into())).load();
    assert!(other_key.is_empty());
}

#[test]
fn overwrites_replace_the_whole_map_and_export_reflects_it() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(dir.path().join("cache.sqlite")).unwrap());
    let cache = ResponseCache::new(store.clone(), Some("flow".into()));

    let mut map = CacheMap::new();
    map.upsert(response("first", None, &["1"]));
    cache.store(&map).unwrap();
    map.upsert(response("second", None, &["2"]));
    cache.store(&map).unwrap();
    store.set("other", &json!({})).unwrap();

    let export_path = dir.path().join("export.jsonl");
    let written = store.export_jsonl(&export_path).unwrap();
    assert_eq!(written, 2);

    let contents = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let flow = rows.iter().find(|r| r.key == "flow").unwrap();
    assert!(flow.updated_at >= flow.created_at);
    let prompts: Vec<&str> = flow.value.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(prompts, vec!["first", "second"]);
}

#[test]
fn exclusive_lock_creates_a_sibling_lock_file() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let store = SqliteStore::new(&db_path).unwrap();
    assert_eq!(store.path(), db_path.as_path());

    let lock = store.lock_exclusive().unwrap();
    assert!(dir.path().join("cache.lock").exists());
    drop(lock);
    let _again = store.lock_exclusive().unwrap();
}

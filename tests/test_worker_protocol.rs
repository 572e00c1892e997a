use std::{collections::HashMap, time::Duration};

use phylo_worker::{
    config::WorkerConfig,
    logging::init_logging,
    worker::{Inbound, OutboundMessage, Worker},
};
use serde_json::{json, to_value, Value};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::timeout,
};

const FIVE_NODES: &str = r#"{"version": "2.0", "mutations": [{"gene": "S", "residue_pos": 484, "previous_residue": "E", "new_residue": "K"}, {"gene": "N", "residue_pos": 13, "previous_residue": "P", "new_residue": "L"}, {"gene": null, "residue_pos": 5, "previous_residue": "A", "new_residue": "G"}], "total_nodes": 5, "config": {"title": "Five"}}
{"node_id": 0, "parent_id": 0, "x_dist": 0, "y": 0, "num_tips": 3, "mutations": [], "name": "root", "meta_Country": "UK"}
{"node_id": 1, "parent_id": 0, "x_dist": 1, "y": 1, "num_tips": 2, "mutations": [0], "name": "inner", "meta_Country": "UK"}
{"node_id": 2, "parent_id": 1, "x_dist": 2, "y": 2, "num_tips": 1, "mutations": [0, 2], "name": "tipA", "meta_Country": "France"}
{"node_id": 3, "parent_id": 1, "x_dist": 2.5, "y": 3, "num_tips": 1, "mutations": [1], "name": "tipB", "meta_Country": "Spain"}
{"node_id": 4, "parent_id": 0, "x_dist": 1.5, "y": 4, "num_tips": 1, "mutations": [], "name": "tipC", "meta_Country": "france"}
"#;

fn start() -> (Worker, UnboundedReceiver<OutboundMessage>) {
    init_logging();
    let (outbox, outbound) = unbounded_channel();
    (Worker::new(WorkerConfig::default(), outbox), outbound)
}

fn send(worker: &Worker, msg: Value) {
    match Inbound::from_value(msg) {
        Ok(inbound) => {
            worker.spawn_request(inbound);
        }
        Err(response) => panic!("request did not parse: {:?}", response),
    }
}

fn upload_five(worker: &Worker) {
    send(
        worker,
        json!({"type": "upload", "filename": "five.jsonl", "filetype": "jsonl", "data": FIVE_NODES}),
    );
}

async fn next_message(outbound: &mut UnboundedReceiver<OutboundMessage>) -> Value {
    let msg = timeout(Duration::from_secs(10), outbound.recv())
        .await
        .expect("timed out waiting for the worker")
        .expect("worker hung up");
    to_value(&msg).unwrap()
}

/// Read messages until every id in `ids` has been answered, returning those
/// answers.  Status messages are skipped.
async fn answers(
    outbound: &mut UnboundedReceiver<OutboundMessage>,
    ids: &[u64],
) -> HashMap<u64, Value> {
    let mut found = HashMap::new();
    while found.len() < ids.len() {
        let msg = next_message(outbound).await;
        if let Some(id) = msg.get("request_id").and_then(Value::as_u64) {
            if ids.contains(&id) {
                found.insert(id, msg);
            }
        }
    }
    found
}

/// Read status messages until one reports readiness or an error.
async fn final_status(outbound: &mut UnboundedReceiver<OutboundMessage>) -> Value {
    loop {
        let msg = next_message(outbound).await;
        if msg["type"] != "status" {
            continue;
        }
        if msg["data"].get("error").is_some() || msg["data"]["message"] == "Dataset ready" {
            return msg;
        }
    }
}

#[tokio::test]
async fn test_requests_before_upload_resolve_after_it() {
    let (worker, mut outbound) = start();

    send(&worker, json!({"type": "query", "request_id": 1, "bounds": {"min_y": -10, "max_y": 2}}));
    send(&worker, json!({"type": "config", "request_id": 2}));
    send(&worker, json!({"type": "details", "request_id": 3, "node_id": 2}));
    send(&worker, json!({"type": "list", "request_id": 4, "node_id": 1, "key": "name"}));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(outbound.try_recv().is_err());

    upload_five(&worker);
    let found = answers(&mut outbound, &[1, 2, 3, 4]).await;

    let query = &found[&1];
    assert_eq!(query["type"], "query");
    let ids: Vec<u64> = query["data"]["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["node_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![0, 1, 2]);

    let config = &found[&2];
    assert_eq!(config["type"], "config");
    assert_eq!(config["data"]["genes"], json!(["N", "S"]));
    assert_eq!(config["data"]["title"], "Five");
    assert_eq!(
        config["data"]["colorBy"]["colorByOptions"],
        json!(["meta_Country", "genotype", "None"])
    );

    let details = &found[&3];
    assert_eq!(details["type"], "details");
    assert_eq!(details["data"]["mutations"][0]["gene"], "S");
    assert_eq!(details["data"]["mutations"][1]["gene"], Value::Null);

    assert_eq!(found[&4]["data"], json!(["tipA", "tipB"]));
}

#[tokio::test]
async fn test_search_responses_carry_their_key() {
    let (worker, mut outbound) = start();
    upload_five(&worker);
    final_status(&mut outbound).await;

    let uk = json!({"key": "uk-search", "type": "meta_Country", "method": "text_exact", "text": "UK"});
    let s484 = json!({"key": "s484", "type": "mutation", "method": "mutation", "gene": "S", "position": 484, "new_residue": "K"});
    send(&worker, json!({"type": "search", "request_id": 10, "search": uk.to_string()}));
    send(&worker, json!({"type": "search", "request_id": 11, "search": s484.to_string()}));

    let found = answers(&mut outbound, &[10, 11]).await;
    assert_eq!(found[&10]["data"]["key"], "uk-search");
    assert_eq!(found[&10]["data"]["total_count"], 2);
    assert_eq!(found[&10]["data"]["type"], "complete");
    assert_eq!(found[&11]["data"]["key"], "s484");
    let hits: Vec<u64> = found[&11]["data"]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|hit| hit["node_id"].as_u64().unwrap())
        .collect();
    assert_eq!(hits, vec![1, 2]);
}

#[tokio::test]
async fn test_unsupported_upload_reports_status_error() {
    let (worker, mut outbound) = start();
    send(&worker, json!({"type": "upload", "filename": "tree.csv", "filetype": "csv", "data": "a,b"}));

    let status = final_status(&mut outbound).await;
    assert_eq!(
        status["data"]["error"],
        "Only Taxonium jsonl files are supported (could not find 'jsonl' in filename)"
    );

    // No dataset, so queries keep waiting.
    send(&worker, json!({"type": "config", "request_id": 1}));
    let waited = timeout(Duration::from_millis(50), outbound.recv()).await;
    assert!(waited.is_err());
    assert!(worker.state().gate.current().is_none());
}

#[tokio::test]
async fn test_malformed_dataset_reports_status_error() {
    let (worker, mut outbound) = start();
    send(
        &worker,
        json!({"type": "upload", "filename": "bad.jsonl", "data": "{\"mutations\": []}\n{\"node_id\": 0}\n"}),
    );
    let status = final_status(&mut outbound).await;
    assert!(status["data"]["error"].as_str().unwrap().starts_with("line 2"));
    assert!(worker.state().gate.current().is_none());
}

#[tokio::test]
async fn test_bad_requests_fail_alone() {
    let (worker, mut outbound) = start();
    upload_five(&worker);
    final_status(&mut outbound).await;

    send(&worker, json!({"type": "details", "request_id": 1, "node_id": 99}));
    send(&worker, json!({"type": "search", "request_id": 2, "search": "{broken"}));
    send(&worker, json!({"type": "config", "request_id": 3}));

    let found = answers(&mut outbound, &[1, 2, 3]).await;
    assert_eq!(found[&1]["type"], "error");
    assert_eq!(found[&1]["data"]["request_type"], "details");
    assert_eq!(found[&1]["data"]["layer"], "bad_input");
    assert_eq!(found[&2]["type"], "error");
    assert_eq!(found[&2]["data"]["request_type"], "search");
    assert_eq!(found[&3]["type"], "config");
    assert_eq!(found[&3]["data"]["num_nodes"], 5);
}

#[tokio::test]
async fn test_newick_upload() {
    let (worker, mut outbound) = start();
    send(
        &worker,
        json!({"type": "upload", "filename": "tree.nwk", "filetype": "nwk", "data": "((A:1,B:2)AB:1,C:0.5)root;"}),
    );
    final_status(&mut outbound).await;

    send(&worker, json!({"type": "list", "request_id": 1, "node_id": 0, "key": "name"}));
    send(&worker, json!({"type": "config", "request_id": 2}));
    let found = answers(&mut outbound, &[1, 2]).await;
    assert_eq!(found[&1]["data"], json!(["A", "B", "C"]));
    assert_eq!(found[&2]["data"]["genes"], json!([]));
    assert_eq!(found[&2]["data"]["defaultColorByField"], "None");
}

#[tokio::test]
async fn test_run_serves_until_inbox_closes() {
    let (worker, mut outbound) = start();
    let (inbox_tx, inbox) = unbounded_channel();
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(inbox).await })
    };

    for line in [
        r#"{"type": "upload", "filename": "t.nwk", "filetype": "nwk", "data": "(A,B);"}"#,
        r#"{"type": "details", "request_id": 5, "node_id": 1}"#,
    ] {
        inbox_tx.send(Inbound::parse_line(line).unwrap()).unwrap();
    }
    drop(inbox_tx);
    runner.await.unwrap();

    let found = answers(&mut outbound, &[5]).await;
    assert_eq!(found[&5]["data"]["name"], "A");
}

#[tokio::test]
async fn test_search_after_reload_uses_new_tree() {
    let (worker, mut outbound) = start();
    upload_five(&worker);
    final_status(&mut outbound).await;

    let tips = json!({"key": "tips", "type": "name", "method": "text_match", "text": "tip"}).to_string();
    send(&worker, json!({"type": "search", "request_id": 1, "search": tips}));
    let found = answers(&mut outbound, &[1]).await;
    assert_eq!(found[&1]["data"]["total_count"], 3);

    send(
        &worker,
        json!({"type": "upload", "filename": "small.nwk", "filetype": "nwk", "data": "(tipX,tipY);"}),
    );
    final_status(&mut outbound).await;
    assert_eq!(worker.state().gate.current().unwrap().nodes.len(), 3);

    send(&worker, json!({"type": "search", "request_id": 2, "search": tips}));
    send(&worker, json!({"type": "config", "request_id": 3}));
    let found = answers(&mut outbound, &[2, 3]).await;
    assert_eq!(found[&2]["type"], "search");
    assert_eq!(found[&2]["data"]["total_count"], 2);
    let hits: Vec<u64> = found[&2]["data"]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|hit| hit["node_id"].as_u64().unwrap())
        .collect();
    assert_eq!(hits, vec![1, 2]);
    assert_eq!(found[&3]["data"]["num_nodes"], 3);
}

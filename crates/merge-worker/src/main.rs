//! Sidecar worker process spawned by the Job Manager's process pool
//! (SPEC_FULL §4.1.1). Reads one `WorkerRequest` per stdin line, merges the
//! batch it describes, and writes one `WorkerReply` per stdout line.
//! Mirrors this codebase's convention of a dedicated worker binary per
//! `cmd/*`, signaling readiness with a single printed line before serving.

use anyhow::Context;
use futures::TryStreamExt;
use mappers::MapperRegistry;
use merge_worker_proto::{MergeBatchTask, WorkerReply, WorkerRequest, WorkerResponse, WORKER_READY_LINE};
use mongodb::bson::{doc, Bson};
use mongodb::options::UpdateOptions;
use mongodb::Client;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Default)]
struct ClientCache {
    clients: HashMap<String, Client>,
}

impl ClientCache {
    async fn get_or_connect(&mut self, uri: &str) -> anyhow::Result<Client> {
        if let Some(client) = self.clients.get(uri) {
            return Ok(client.clone());
        }
        let client = Client::with_uri_str(uri)
            .await
            .context("connecting to document store")?;
        self.clients.insert(uri.to_string(), client.clone());
        Ok(client)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default failed");

    let mappers = MapperRegistry::new();
    let mut clients = ClientCache::default();
    let mut sys = sysinfo::System::new();
    let pid = sysinfo::get_current_pid().expect("current process has a pid");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    write_line(&mut stdout, WORKER_READY_LINE).await?;

    while let Some(line) = lines.next_line().await.context("reading from stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest =
            serde_json::from_str(&line).context("parsing worker request")?;

        let response = handle_task(&mappers, &mut clients, request.task).await;

        sys.refresh_process(pid);
        let rss_bytes = sys.process(pid).map(|p| p.memory()).unwrap_or(0);

        let reply = WorkerReply { response, rss_bytes };
        let reply_line = serde_json::to_string(&reply).context("encoding worker reply")?;
        write_line(&mut stdout, &reply_line).await?;
    }

    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> anyhow::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[tracing::instrument(skip(mappers, clients, task), fields(batch_num = task.batch_num, source = %task.source_collection))]
async fn handle_task(
    mappers: &MapperRegistry,
    clients: &mut ClientCache,
    task: MergeBatchTask,
) -> WorkerResponse {
    match run_batch(mappers, clients, &task).await {
        Ok(merged_count) => WorkerResponse::Merged {
            batch_num: task.batch_num,
            merged_count,
        },
        Err(err) => {
            tracing::warn!(%err, "batch failed");
            let dump_file = write_crash_dump(&task, &err);
            WorkerResponse::Failed {
                batch_num: task.batch_num,
                message: err.to_string(),
                dump_file,
            }
        }
    }
}

async fn run_batch(
    mappers: &MapperRegistry,
    clients: &mut ClientCache,
    task: &MergeBatchTask,
) -> anyhow::Result<i64> {
    let source_client = clients.get_or_connect(&task.source_db_uri).await?;
    let target_client = if task.target_db_uri == task.source_db_uri {
        source_client.clone()
    } else {
        clients.get_or_connect(&task.target_db_uri).await?
    };

    let source_col: mongodb::Collection<mongodb::bson::Document> = source_client
        .database(&task.source_db_name)
        .collection(&task.source_collection);
    let target_col: mongodb::Collection<mongodb::bson::Document> = target_client
        .database(&task.target_db_name)
        .collection(&task.target_collection);

    let ids: Vec<Bson> = task
        .ids
        .iter()
        .map(mongodb::bson::to_bson)
        .collect::<Result<_, _>>()
        .context("decoding batch ids")?;

    let mut cursor = source_col
        .find(doc! { "_id": { "$in": ids } }, None)
        .await
        .context("reading source batch")?;
    let mut docs = Vec::new();
    while let Some(doc) = cursor.try_next().await.context("reading source document")? {
        docs.push(doc);
    }

    let mapper = mappers
        .resolve(&task.mapper)
        .await
        .context("resolving mapper")?;
    let mapped = mapper.process(docs).context("applying mapper")?;

    let mut merged_count = 0i64;
    for mut doc in mapped {
        let id = doc
            .remove("_id")
            .context("mapped document missing _id")?;
        let opts = UpdateOptions::builder().upsert(task.upsert).build();
        let result = target_col
            .update_one(doc! { "_id": id }, doc! { "$set": doc }, opts)
            .await
            .context("writing target document")?;
        if result.modified_count > 0 || result.upserted_id.is_some() {
            merged_count += 1;
        }
    }

    Ok(merged_count)
}

/// Writes `build_<target>_<source>_batch_<n>.json` to the worker's current
/// directory for post-mortem, per SPEC_FULL §7.1. Best-effort: a failure to
/// write the dump is logged but does not change the reported outcome.
fn write_crash_dump(task: &MergeBatchTask, err: &anyhow::Error) -> String {
    let filename = format!(
        "build_{}_{}_batch_{}.json",
        task.target_collection, task.source_collection, task.batch_num
    );
    let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
    let dump = serde_json::json!({
        "task": task,
        "error": err.to_string(),
        "error_chain": chain,
        "error_debug": format!("{err:?}"),
    });
    match serde_json::to_vec_pretty(&dump) {
        Ok(body) => {
            if let Err(write_err) = std::fs::write(&filename, body) {
                tracing::error!(%write_err, file = %filename, "failed to write crash dump");
            }
        }
        Err(encode_err) => {
            tracing::error!(%encode_err, "failed to encode crash dump");
        }
    }
    filename
}

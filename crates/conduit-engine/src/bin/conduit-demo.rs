//! Conduit demo - runs one chain through a small set of units.
//!
//! Usage: `conduit-demo [CONFIG_FILE] [TEXT]`. Without a config file the
//! layered configuration (`~/.conduit/config.toml`, workspace, env) is used.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use conduit_config::Config;
use conduit_engine::{ChainOptions, PluginExecutionEngine, config_bridge};
use conduit_plugins::{
    Contribution, ExecutionContext, PluginUnit, UnitDescriptor, UnitError, UnitId, UnitKind,
    UnitResult,
};
use serde_json::{Value, json};
use tracing::info;

/// Lowercases and trims the input text.
struct Normalize {
    descriptor: UnitDescriptor,
}

#[async_trait]
impl PluginUnit for Normalize {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> UnitResult<Option<Value>> {
        let text = ctx
            .input
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| UnitError::execution("input has no text"))?
            .trim()
            .to_lowercase();
        ctx.chain_state.insert("normalized", Value::String(text.clone()));
        ctx.input = json!({ "text": text });
        Ok(None)
    }
}

/// Counts words of the normalized text.
struct WordCount {
    descriptor: UnitDescriptor,
}

#[async_trait]
impl PluginUnit for WordCount {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> UnitResult<Option<Value>> {
        let words = ctx
            .chain_state
            .get("normalized")
            .and_then(Value::as_str)
            .map_or(0, |text| text.split_whitespace().count());
        Ok(Some(json!({ "words": words })))
    }
}

/// Pretends to archive the request in the background.
struct Archive {
    descriptor: UnitDescriptor,
}

#[async_trait]
impl PluginUnit for Archive {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> UnitResult<Option<Value>> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Some(json!({ "archived": ctx.request_id.to_string() })))
    }
}

fn demo_units() -> anyhow::Result<Vec<Arc<dyn PluginUnit>>> {
    let normalize = UnitId::new("normalize")?;
    Ok(vec![
        Arc::new(Normalize {
            descriptor: UnitDescriptor::new(
                normalize.clone(),
                "Normalize",
                UnitKind::MessagePreprocessor,
            ),
        }),
        Arc::new(WordCount {
            descriptor: UnitDescriptor::new(
                UnitId::new("word-count")?,
                "Word count",
                UnitKind::Synchronous,
            )
            .with_priority(10)
            .with_dependency(normalize)
            .with_contribution(Contribution::tool(
                "word_count",
                "Count words",
                json!({ "type": "object" }),
            )),
        }),
        Arc::new(Archive {
            descriptor: UnitDescriptor::new(
                UnitId::new("archive")?,
                "Archive",
                UnitKind::Asynchronous,
            ),
        }),
    ])
}

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_file(Path::new(path))
            .with_context(|| format!("failed to load config from {path}")),
        None => Ok(Config::load(None).context("failed to load config")?.config),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = load_config(args.next().as_deref())?;
    let text = args
        .next()
        .unwrap_or_else(|| "  Hello From The Conduit Demo  ".to_string());

    let _guard = conduit_telemetry::setup_logging(&config_bridge::log_config(&config.logging)?)?;

    let engine = PluginExecutionEngine::from_config(&config);
    for unit in demo_units()? {
        let status = engine.register_unit(unit).await?;
        info!(status = %status, "Registered demo unit");
    }

    let mut ctx = ExecutionContext::new(json!({ "text": text })).with_user("demo");
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    for (unit_id, task_id) in &outcome.async_tasks {
        let task = engine
            .tracker()
            .await_completion(*task_id, Duration::from_secs(5))
            .await?;
        println!("{unit_id}: {} {}", task.status.as_str(), task.result.unwrap_or(Value::Null));
    }

    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    let report = engine.shutdown(engine.settings().shutdown_grace).await;
    info!(
        completed = report.tasks.completed,
        cancelled = report.tasks.cancelled,
        units = report.units_unregistered,
        "Demo finished"
    );
    Ok(())
}

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use rbwasm_engine::engine::{CRubyEngine, EngineConfig};
use rbwasm_engine::pipeline::ProgressObserver;
use rbwasm_engine::{OutputSink, StreamLabel};

fn debug_log<F: FnOnce() -> String>(message: F) {
    if env::var("RBWASM_HOST_DEBUG").is_ok() {
        eprintln!("[rbwasm-host] {}", message());
    }
}

/// Forwards virtualized guest streams to the host's real streams.
struct StdStreamSink;

impl OutputSink for StdStreamSink {
    fn print(&self, text: &str, stream: StreamLabel) {
        match stream {
            StreamLabel::Stdout => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            StreamLabel::Stderr => eprint!("{text}"),
        }
    }
}

struct StderrProgress;

impl ProgressObserver for StderrProgress {
    fn stage(&self, label: &str) {
        eprintln!("[rbwasm-host] {label}");
    }
}

fn load_config() -> Result<EngineConfig> {
    if let Ok(raw) = env::var("RBWASM_CONFIG") {
        if !raw.is_empty() {
            return serde_json::from_str(&raw).context("parse RBWASM_CONFIG");
        }
    }
    let mut config = EngineConfig::default();
    if let Ok(url) = env::var("RBWASM_MODULE_URL") {
        if !url.is_empty() {
            config.module_url = url;
        }
    }
    if let Ok(version) = env::var("RBWASM_RUBY_VERSION") {
        if !version.is_empty() {
            config.version = version;
        }
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    debug_log(|| "starting".to_string());
    let mut args = env::args().skip(1);
    let arg = match args.next() {
        Some(flag) if flag == "-h" || flag == "--help" => {
            eprintln!("usage: rbwasm-host [script.rb]");
            eprintln!("reads the script from stdin when no path (or '-') is given");
            return Ok(());
        }
        other => other,
    };

    let source = match arg.as_deref() {
        Some(path) if path != "-" => {
            fs::read_to_string(path).with_context(|| format!("read {path}"))?
        }
        _ => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).context("read stdin")?;
            buf
        }
    };

    let config = load_config()?;
    let mut engine = CRubyEngine::new(config, Arc::new(StdStreamSink), Arc::new(StderrProgress))?;
    debug_log(|| format!("engine: {}", engine.name()));

    let result = engine.run(&source).await?;
    println!("=> {result}");
    Ok(())
}

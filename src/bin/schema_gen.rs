//! `ephaptic-schema`: introspects a frozen [`ephaptic::Registry`] and
//! prints its procedure/event schema as JSON.
//!
//! Unlike a dynamically-loaded-module CLI, this always introspects the
//! demo registry this crate ships — Rust has no runtime-import equivalent
//! to point it at an arbitrary user module instead.

use clap::Parser;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "ephaptic-schema", about = "Emit the JSON method/event schema of the demo registry")]
struct Cli {
    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

#[derive(Serialize)]
struct ParamSchema {
    name: &'static str,
    type_label: &'static str,
    has_default: bool,
}

#[derive(Serialize)]
struct ProcedureSchema {
    name: String,
    params: Vec<ParamSchema>,
    response_type: Option<&'static str>,
    rate_limit: Option<RateLimitSchema>,
    requires_login: bool,
}

#[derive(Serialize)]
struct RateLimitSchema {
    max_requests: u64,
    window_seconds: u64,
}

#[derive(Serialize)]
struct EventSchema {
    name: &'static str,
}

#[derive(Serialize)]
struct Schema {
    procedures: Vec<ProcedureSchema>,
    events: Vec<EventSchema>,
}

fn main() {
    let cli = Cli::parse();
    let registry = ephaptic::demo::build_registry().build();

    let mut procedures: Vec<ProcedureSchema> = registry
        .procedures()
        .map(|meta| ProcedureSchema {
            name: meta.name.clone(),
            params: meta
                .params
                .iter()
                .map(|p| ParamSchema { name: p.name, type_label: p.type_label, has_default: p.default.is_some() })
                .collect(),
            response_type: meta.response_type_label,
            rate_limit: meta.rate_limit.map(|(max_requests, window_seconds)| RateLimitSchema { max_requests, window_seconds }),
            requires_login: meta.requires_login,
        })
        .collect();
    procedures.sort_by(|a, b| a.name.cmp(&b.name));

    let events = registry.events().iter().map(|e| EventSchema { name: e.name }).collect();

    let schema = Schema { procedures, events };

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&schema)
    } else {
        serde_json::to_string(&schema)
    }
    .expect("schema is always serializable");

    println!("{rendered}");
}

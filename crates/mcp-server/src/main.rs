use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recollect::{CallerScope, DecayClass, FactAttributes, FactId, ScopeKind, Tier};
use recollect_agent_memory::{EngineConfig, MemoryEngine, RecallOptions, ScopeParams};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeSet;
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_QUERY_BYTES: usize = 8 * 1024; // 8 KiB
const MAX_FIELD_BYTES: usize = 512;
const MAX_IDEMPOTENCY_KEY_BYTES: usize = 512;
const MAX_TAGS: usize = 32;
const MAX_RECALL_LIMIT: usize = 200;

struct AppState {
    engine: MemoryEngine,
    runtime: Runtime,
    /// Identity this process was started for. Caller-supplied ids are
    /// checked against it according to the engine's scope trust.
    identity: Option<CallerScope>,
}

impl AppState {
    fn open() -> Result<Self> {
        let data_dir =
            env::var("RECOLLECT_MCP_DATA_DIR").unwrap_or_else(|_| "./recollect-mcp-data".to_string());
        let config = match env::var("RECOLLECT_MCP_CONFIG") {
            Ok(path) => EngineConfig::from_json_file(&path)
                .with_context(|| format!("failed to load config {path}"))?,
            Err(_) => EngineConfig::default(),
        };
        let engine = MemoryEngine::open(&data_dir, config)
            .with_context(|| format!("failed to open memory at {data_dir}"))?;
        tracing::info!(data_dir = %data_dir, "memory engine opened");
        Self::with_engine(engine, identity_from_env())
    }

    fn with_engine(engine: MemoryEngine, identity: Option<CallerScope>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        Ok(Self {
            engine,
            runtime,
            identity,
        })
    }
}

fn identity_from_env() -> Option<CallerScope> {
    let var = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
    let identity = CallerScope {
        user_id: var("RECOLLECT_MCP_USER_ID"),
        agent_id: var("RECOLLECT_MCP_AGENT_ID"),
        session_id: var("RECOLLECT_MCP_SESSION_ID"),
    };
    (identity != CallerScope::default()).then_some(identity)
}

fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = AppState::open().context("failed to open recollect memory")?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Answer with a JSON-RPC parse error (-32700) and keep reading.
                tracing::warn!(error = %e, "malformed message");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "recollect-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn caller_properties() -> JsonValue {
    json!({
        "user_id": {"type": "string"},
        "agent_id": {"type": "string"},
        "session_id": {"type": "string"}
    })
}

fn with_caller(mut properties: JsonValue) -> JsonValue {
    if let (Some(props), Some(caller)) = (properties.as_object_mut(), caller_properties().as_object()) {
        props.extend(caller.clone());
    }
    properties
}

fn tools_schema() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "remember",
            "description": "Store a fact. The engine decides whether it is new, updates or retracts an existing fact, or is already known.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "category": {"type": "string"},
                    "importance": {"type": "number", "minimum": 0, "maximum": 1},
                    "entity": {"type": "string"},
                    "key": {"type": "string"},
                    "value": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}, "maxItems": MAX_TAGS},
                    "decay_class": {"type": "string", "enum": ["permanent", "stable", "active", "session", "checkpoint"]},
                    "tier": {"type": "string", "enum": ["hot", "warm", "cold"]},
                    "source_date": {"type": "string"},
                    "scope": {"type": "string", "enum": ["global", "user", "agent", "session"]},
                    "scope_target": {"type": "string"},
                    "idempotency_key": {"type": "string"}
                },
                "required": ["text"]
            }
        }),
        json!({
            "name": "recall",
            "description": "Hybrid lexical + semantic recall of visible facts.",
            "inputSchema": {
                "type": "object",
                "properties": with_caller(json!({
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_RECALL_LIMIT},
                    "include_superseded": {"type": "boolean"},
                    "include_cold": {"type": "boolean"},
                    "as_of": {"type": "string"}
                })),
                "required": ["query"]
            }
        }),
        json!({
            "name": "forget",
            "description": "Permanently delete a fact.",
            "inputSchema": {
                "type": "object",
                "properties": with_caller(json!({ "fact_id": {"type": "string"} })),
                "required": ["fact_id"]
            }
        }),
        json!({
            "name": "get_fact",
            "description": "Fetch one fact by id, optionally as it stood at a point in time.",
            "inputSchema": {
                "type": "object",
                "properties": with_caller(json!({
                    "fact_id": {"type": "string"},
                    "as_of": {"type": "string"}
                })),
                "required": ["fact_id"]
            }
        }),
        json!({
            "name": "history",
            "description": "Every version of a fact, oldest first.",
            "inputSchema": {
                "type": "object",
                "properties": with_caller(json!({ "fact_id": {"type": "string"} })),
                "required": ["fact_id"]
            }
        }),
        json!({
            "name": "wal_status",
            "description": "Write-ahead log health and incomplete writes.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

fn call_tool(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    let engine = &state.engine;
    let identity = state.identity.as_ref();

    match name {
        "remember" => {
            let text = required_str(&args, "text")?;
            if text.len() > recollect::MAX_TEXT_BYTES {
                anyhow::bail!(
                    "text exceeds max allowed size ({} bytes)",
                    recollect::MAX_TEXT_BYTES
                );
            }
            let attrs = parse_attributes(&args)?;
            let kind = match optional_str(&args, "scope")? {
                Some(s) => s.parse::<ScopeKind>()?,
                None => ScopeKind::Global,
            };
            let mut scope = ScopeParams::new(kind, optional_str(&args, "scope_target")?.map(str::to_string));
            scope.identity = identity.cloned();

            let outcome = state.runtime.block_on(engine.store(text, attrs, scope))?;
            let action = format!("{:?}", outcome.action).to_lowercase();
            let summary = match &outcome.id {
                Some(id) => format!("{action} {id}: {}", outcome.reason),
                None => format!("{action}: {}", outcome.reason),
            };
            Ok(json!({
                "content": [{ "type": "text", "text": summary }],
                "structuredContent": outcome
            }))
        }
        "recall" => {
            let query = required_str(&args, "query")?;
            if query.len() > MAX_QUERY_BYTES {
                anyhow::bail!("query exceeds max allowed size ({} bytes)", MAX_QUERY_BYTES);
            }
            let limit = args.get("limit").and_then(JsonValue::as_u64).unwrap_or(10) as usize;
            if limit > MAX_RECALL_LIMIT {
                anyhow::bail!("limit exceeds max allowed value ({MAX_RECALL_LIMIT})");
            }
            let opts = RecallOptions {
                include_superseded: optional_bool(&args, "include_superseded"),
                include_cold: optional_bool(&args, "include_cold"),
                as_of: parse_time(&args, "as_of")?,
                identity: identity.cloned(),
            };
            let caller = parse_caller(&args)?;
            let recall = state
                .runtime
                .block_on(engine.recall(query, limit, &caller, &opts))?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("found {} fact(s)", recall.facts.len()) }],
                "structuredContent": recall
            }))
        }
        "forget" => {
            let fact_id = parse_fact_id(&args)?;
            let caller = parse_caller(&args)?;
            let removed = state
                .runtime
                .block_on(engine.forget(&fact_id, &caller, identity))?;
            let text = if removed {
                format!("forgot fact {fact_id}")
            } else {
                format!("no visible fact {fact_id}")
            };
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "structuredContent": { "fact_id": fact_id, "removed": removed }
            }))
        }
        "get_fact" => {
            let fact_id = parse_fact_id(&args)?;
            let caller = parse_caller(&args)?;
            let as_of = parse_time(&args, "as_of")?;
            let fact = state
                .runtime
                .block_on(engine.get(&fact_id, &caller, identity, as_of))?;
            let text = match &fact {
                Some(f) => f.text.clone(),
                None => format!("no visible fact {fact_id}"),
            };
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "structuredContent": { "fact": fact }
            }))
        }
        "history" => {
            let fact_id = parse_fact_id(&args)?;
            let caller = parse_caller(&args)?;
            let chain = state
                .runtime
                .block_on(engine.history(&fact_id, &caller, identity))?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} version(s)", chain.len()) }],
                "structuredContent": { "facts": chain }
            }))
        }
        "wal_status" => {
            let stats = engine.wal_status();
            let orphans = state.runtime.block_on(engine.orphans())?;
            let orphan_ids: Vec<&str> = orphans.iter().map(|o| o.fact_id.as_str()).collect();
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} incomplete write(s)", orphans.len()) }],
                "structuredContent": { "stats": stats, "orphans": orphan_ids }
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn required_str<'a>(args: &'a JsonValue, field: &str) -> Result<&'a str> {
    args.get(field)
        .and_then(JsonValue::as_str)
        .with_context(|| format!("{field} is required"))
}

fn optional_str<'a>(args: &'a JsonValue, field: &str) -> Result<Option<&'a str>> {
    let value = args.get(field).and_then(JsonValue::as_str);
    if let Some(v) = value {
        if v.len() > MAX_FIELD_BYTES {
            anyhow::bail!("{field} exceeds max allowed size ({MAX_FIELD_BYTES} bytes)");
        }
    }
    Ok(value)
}

fn optional_bool(args: &JsonValue, field: &str) -> bool {
    args.get(field).and_then(JsonValue::as_bool).unwrap_or(false)
}

fn parse_time(args: &JsonValue, field: &str) -> Result<Option<DateTime<Utc>>> {
    match args.get(field).and_then(JsonValue::as_str) {
        Some(s) => Ok(Some(
            s.parse::<DateTime<Utc>>()
                .with_context(|| format!("{field} must be RFC3339"))?,
        )),
        None => Ok(None),
    }
}

fn parse_fact_id(args: &JsonValue) -> Result<FactId> {
    let raw = required_str(args, "fact_id")?;
    if raw.len() > MAX_FIELD_BYTES {
        anyhow::bail!("fact_id exceeds max allowed size ({MAX_FIELD_BYTES} bytes)");
    }
    Ok(FactId(raw.to_string()))
}

fn parse_caller(args: &JsonValue) -> Result<CallerScope> {
    Ok(CallerScope {
        user_id: optional_str(args, "user_id")?.map(str::to_string),
        agent_id: optional_str(args, "agent_id")?.map(str::to_string),
        session_id: optional_str(args, "session_id")?.map(str::to_string),
    })
}

fn parse_attributes(args: &JsonValue) -> Result<FactAttributes> {
    let mut attrs = FactAttributes::default();
    if let Some(category) = optional_str(args, "category")? {
        attrs.category = category.to_string();
    }
    if let Some(importance) = args.get("importance").and_then(JsonValue::as_f64) {
        attrs.importance = importance as f32;
    }
    attrs.entity = optional_str(args, "entity")?.map(str::to_string);
    attrs.key = optional_str(args, "key")?.map(str::to_string);
    attrs.value = optional_str(args, "value")?.map(str::to_string);

    if let Some(tags) = args.get("tags").and_then(JsonValue::as_array) {
        if tags.len() > MAX_TAGS {
            anyhow::bail!("at most {MAX_TAGS} tags are allowed");
        }
        attrs.tags = tags
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
    }
    if let Some(decay) = optional_str(args, "decay_class")? {
        attrs.decay_class = decay.parse::<DecayClass>()?;
    }
    if let Some(tier) = optional_str(args, "tier")? {
        attrs.tier = Some(tier.parse::<Tier>()?);
    }
    attrs.source_date = parse_time(args, "source_date")?;

    if let Some(key) = args.get("idempotency_key").and_then(JsonValue::as_str) {
        if key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
            anyhow::bail!(
                "idempotency_key exceeds max allowed size ({} bytes)",
                MAX_IDEMPOTENCY_KEY_BYTES
            );
        }
        attrs.idempotency_key = Some(key.to_string());
    }
    Ok(attrs)
}

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use switchyard_domain::{now_utc, CapabilityRole, DispatchError};

/// Input handed to a capability: the (possibly context-prefixed)
/// prompt plus any retrieved documents the capability may ground on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityInput {
    pub prompt: String,
    #[serde(default)]
    pub context_documents: Vec<String>,
}

impl CapabilityInput {
    #[must_use]
    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            context_documents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvocationMetadata {
    pub model: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityResponse {
    pub text: String,
    pub metadata: InvocationMetadata,
}

/// Seam for the actual response generation. The control plane never
/// sees what is behind it: a deterministic in-process stub, an HTTP
/// endpoint, or a real model runtime all look the same.
pub trait CapabilityAdapter: Send + Sync {
    fn capability_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn invoke(&self, input: &CapabilityInput) -> Result<CapabilityResponse>;
}

/// In-process adapter producing a stable token-derived response.
/// The same input always yields the same output, which keeps traces
/// and tests reproducible.
#[derive(Debug, Clone)]
pub struct DeterministicCapability {
    adapter_version: String,
    model_id: String,
}

impl Default for DeterministicCapability {
    fn default() -> Self {
        Self {
            adapter_version: "deterministic.v1".to_string(),
            model_id: "deterministic-v1".to_string(),
        }
    }
}

impl DeterministicCapability {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn deterministic_token(&self, input: &CapabilityInput) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.prompt.as_bytes());
        hasher.update(self.model_id.as_bytes());
        hasher.update(self.adapter_version.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl CapabilityAdapter for DeterministicCapability {
    fn capability_name(&self) -> &'static str {
        "deterministic"
    }

    fn invoke(&self, input: &CapabilityInput) -> Result<CapabilityResponse> {
        let token = self.deterministic_token(input);
        let text = format!(
            "deterministic:{}:{}",
            input.context_documents.len(),
            token.chars().take(16).collect::<String>()
        );

        let prompt_len = u64::try_from(input.prompt.len()).unwrap_or(u64::MAX);
        let text_len = u64::try_from(text.len()).unwrap_or(u64::MAX);
        Ok(CapabilityResponse {
            metadata: InvocationMetadata {
                model: self.model_id.clone(),
                tokens_used: prompt_len / 4 + text_len / 4,
                latency_ms: 5 + prompt_len % 17,
            },
            text,
        })
    }
}

/// HTTP JSON adapter. POSTs the prompt to a configured endpoint and
/// expects `{ "text": ..., "model": ..., "tokens_used": ... }` back.
#[derive(Debug, Clone)]
pub struct HttpJsonCapability {
    adapter_version: String,
    config: HttpCapabilityConfig,
}

impl HttpJsonCapability {
    /// Build the adapter from its JSON parameter object.
    ///
    /// # Errors
    /// Returns an error if `params.url` is missing, a header value is
    /// not a string, or the configured auth env var is unset.
    pub fn from_params(params: &Value) -> Result<Self> {
        Ok(Self {
            adapter_version: "http_json.v1".to_string(),
            config: HttpCapabilityConfig::from_params(params)?,
        })
    }
}

impl CapabilityAdapter for HttpJsonCapability {
    fn capability_name(&self) -> &'static str {
        "http_json"
    }

    fn invoke(&self, input: &CapabilityInput) -> Result<CapabilityResponse> {
        let started_at = now_utc();
        let outbound_json = json!({
            "adapter_version": self.adapter_version,
            "prompt": input.prompt,
            "context_documents": input.context_documents,
        });

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let body: Value = match req.send_json(&outbound_json) {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow::anyhow!("capability endpoint returned status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow::anyhow!("http transport failure: {err}"));
            }
        };

        let text = body
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("capability response missing 'text'"))?
            .to_string();
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let tokens_used = body.get("tokens_used").and_then(Value::as_u64).unwrap_or(0);

        let ended_at = now_utc();
        let millis = (ended_at - started_at).whole_milliseconds();
        let latency_ms = u64::try_from(millis).unwrap_or(0);

        Ok(CapabilityResponse {
            text,
            metadata: InvocationMetadata {
                model,
                tokens_used,
                latency_ms,
            },
        })
    }
}

#[derive(Debug, Clone)]
struct HttpCapabilityConfig {
    url: String,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpCapabilityConfig {
    fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("http_json capability requires params.url"))?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(30_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("params.headers must be an object"))?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    anyhow::anyhow!("params.headers values must be strings, key='{key}'")
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token = if let Some(env_name) =
            params.get("auth_bearer_env").and_then(Value::as_str)
        {
            Some(std::env::var(env_name).map_err(|_| {
                anyhow::anyhow!("missing env var '{env_name}' required by params.auth_bearer_env")
            })?)
        } else {
            None
        };

        Ok(Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        })
    }
}

/// Explicit role-to-adapter binding. No auto-discovery; an unbound
/// role is a typed dispatch error, never a fallback.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    adapters: BTreeMap<CapabilityRole, Arc<dyn CapabilityAdapter>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, role: CapabilityRole, adapter: Arc<dyn CapabilityAdapter>) {
        self.adapters.insert(role, adapter);
    }

    /// # Errors
    /// Returns [`DispatchError::NoCapability`] when no adapter is bound
    /// to the role.
    pub fn resolve(
        &self,
        role: CapabilityRole,
    ) -> Result<Arc<dyn CapabilityAdapter>, DispatchError> {
        self.adapters
            .get(&role)
            .cloned()
            .ok_or(DispatchError::NoCapability(role))
    }

    #[must_use]
    pub fn roles(&self) -> Vec<CapabilityRole> {
        self.adapters.keys().copied().collect()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}

/// Structured result from tool execution. Tools return data, never
/// user-facing strings; the output lands in result metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub output: Value,
    pub success: bool,
    pub error: Option<String>,
}

impl ToolOutcome {
    #[must_use]
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn fail(error: &str) -> Self {
        Self {
            output: Value::Object(serde_json::Map::default()),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;
    fn run(&self, input: &Value) -> ToolOutcome;
}

/// Basic arithmetic over two operands.
#[derive(Debug, Default)]
pub struct CalculatorTool;

impl Tool for CalculatorTool {
    fn name(&self) -> &'static str {
        "calculator"
    }

    fn description(&self) -> &'static str {
        "Perform basic arithmetic. Input: two operands and an operator."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"},
                "op": {"type": "string", "enum": ["+", "-", "*", "/"]},
            },
            "required": ["a", "b", "op"],
        })
    }

    fn run(&self, input: &Value) -> ToolOutcome {
        let Some(a) = input.get("a").and_then(Value::as_f64) else {
            return ToolOutcome::fail("missing 'a' in input");
        };
        let Some(b) = input.get("b").and_then(Value::as_f64) else {
            return ToolOutcome::fail("missing 'b' in input");
        };
        let Some(op) = input.get("op").and_then(Value::as_str) else {
            return ToolOutcome::fail("missing 'op' in input");
        };

        let result = match op {
            "+" => a + b,
            "-" => a - b,
            "*" => a * b,
            "/" => {
                if b == 0.0 {
                    return ToolOutcome::fail("division by zero");
                }
                a / b
            }
            other => return ToolOutcome::fail(&format!("unsupported operator '{other}'")),
        };

        ToolOutcome::ok(json!({"result": result, "op": op}))
    }
}

/// Keyword lookup over a small fixed document set. Stands in for a
/// vector store behind the same contract.
#[derive(Debug, Default)]
pub struct DocumentLookupTool;

const LOOKUP_DOCUMENTS: &[(&str, &str, &str)] = &[
    (
        "doc_001",
        "Python is a high-level, interpreted programming language known for its simplicity and readability.",
        "programming_guide.md",
    ),
    (
        "doc_002",
        "Machine learning is a subset of artificial intelligence that enables systems to learn from data.",
        "ai_fundamentals.md",
    ),
    (
        "doc_003",
        "Vector databases store embeddings and enable semantic search over unstructured data.",
        "databases.md",
    ),
];

impl Tool for DocumentLookupTool {
    fn name(&self) -> &'static str {
        "document_lookup"
    }

    fn description(&self) -> &'static str {
        "Search and retrieve relevant document chunks for a query."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "k": {"type": "integer", "default": 3},
            },
            "required": ["query"],
        })
    }

    fn run(&self, input: &Value) -> ToolOutcome {
        let Some(query) = input.get("query").and_then(Value::as_str) else {
            return ToolOutcome::fail("missing 'query' in input");
        };
        let k = input
            .get("k")
            .and_then(Value::as_u64)
            .map_or(3, |value| usize::try_from(value).unwrap_or(3));

        let query_lower = query.to_ascii_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        let documents: Vec<Value> = LOOKUP_DOCUMENTS
            .iter()
            .filter(|(_, content, _)| {
                let content_lower = content.to_ascii_lowercase();
                terms.iter().any(|term| content_lower.contains(term))
            })
            .take(k)
            .map(|(id, content, source)| json!({"id": id, "content": content, "source": source}))
            .collect();

        ToolOutcome::ok(json!({
            "total_retrieved": documents.len(),
            "documents": documents,
            "query": query,
        }))
    }
}

/// Explicit tool registration with per-role allow-lists. All tools are
/// registered up front; permissions gate which role may run which tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    allow_lists: BTreeMap<String, BTreeSet<CapabilityRole>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>, allowed_roles: &[CapabilityRole]) {
        let name = tool.name().to_string();
        self.allow_lists
            .insert(name.clone(), allowed_roles.iter().copied().collect());
        self.tools.insert(name, tool);
    }

    #[must_use]
    pub fn list_for_role(&self, role: CapabilityRole) -> Vec<Arc<dyn Tool>> {
        self.tools
            .iter()
            .filter(|(name, _)| {
                self.allow_lists
                    .get(*name)
                    .is_some_and(|roles| roles.contains(&role))
            })
            .map(|(_, tool)| Arc::clone(tool))
            .collect()
    }

    /// Run a tool on behalf of a role.
    ///
    /// # Errors
    /// Returns [`DispatchError::NoTool`] for an unknown tool and
    /// [`DispatchError::ToolNotAllowed`] when the role is not on the
    /// tool's allow-list.
    pub fn run_for_role(
        &self,
        role: CapabilityRole,
        tool_name: &str,
        input: &Value,
    ) -> Result<ToolOutcome, DispatchError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| DispatchError::NoTool(tool_name.to_string()))?;
        let allowed = self
            .allow_lists
            .get(tool_name)
            .is_some_and(|roles| roles.contains(&role));
        if !allowed {
            return Err(DispatchError::ToolNotAllowed {
                role,
                tool: tool_name.to_string(),
            });
        }
        Ok(tool.run(input))
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CalculatorTool, CapabilityAdapter, CapabilityInput, CapabilityRegistry,
        DeterministicCapability, DocumentLookupTool, HttpJsonCapability, Tool, ToolRegistry,
    };
    use serde_json::json;
    use std::sync::Arc;
    use switchyard_domain::{CapabilityRole, DispatchError};

    #[test]
    fn deterministic_capability_is_stable_for_same_input() {
        let capability = DeterministicCapability::new();
        let input = CapabilityInput::from_prompt("what is the capital of france");

        let first = capability.invoke(&input);
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());

        let second = capability.invoke(&input);
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());

        assert_eq!(first.text, second.text);
        assert_eq!(first.metadata, second.metadata);
    }

    #[test]
    fn unresolved_role_is_a_typed_dispatch_error() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityRole::General, Arc::new(DeterministicCapability::new()));

        assert!(registry.resolve(CapabilityRole::General).is_ok());
        let missing = registry.resolve(CapabilityRole::Critic);
        assert!(matches!(
            missing,
            Err(DispatchError::NoCapability(CapabilityRole::Critic))
        ));
        let Err(err) = registry.resolve(CapabilityRole::Retrieval) else {
            unreachable!()
        };
        assert_eq!(err.to_string(), "no capability found for role 'retrieval'");
    }

    #[test]
    fn http_capability_requires_url() {
        let result = HttpJsonCapability::from_params(&json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn calculator_handles_operators_and_division_by_zero() {
        let tool = CalculatorTool;
        let ok = tool.run(&json!({"a": 6.0, "b": 7.0, "op": "*"}));
        assert!(ok.success);
        assert_eq!(ok.output["result"], 42.0);

        let div_zero = tool.run(&json!({"a": 1.0, "b": 0.0, "op": "/"}));
        assert!(!div_zero.success);
    }

    #[test]
    fn document_lookup_matches_on_keywords() {
        let tool = DocumentLookupTool;
        let outcome = tool.run(&json!({"query": "python language"}));
        assert!(outcome.success);
        assert_eq!(outcome.output["total_retrieved"], 1);

        let missing_query = tool.run(&json!({}));
        assert!(!missing_query.success);
    }

    #[test]
    fn tool_registry_enforces_allow_lists() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorTool), &[CapabilityRole::General]);
        registry.register(Arc::new(DocumentLookupTool), &[CapabilityRole::Retrieval]);

        let allowed = registry.run_for_role(
            CapabilityRole::General,
            "calculator",
            &json!({"a": 1.0, "b": 2.0, "op": "+"}),
        );
        assert!(allowed.is_ok());

        let denied = registry.run_for_role(CapabilityRole::General, "document_lookup", &json!({}));
        assert!(matches!(denied, Err(DispatchError::ToolNotAllowed { .. })));

        let unknown = registry.run_for_role(CapabilityRole::General, "rocket", &json!({}));
        assert!(matches!(unknown, Err(DispatchError::NoTool(_))));

        assert_eq!(registry.list_for_role(CapabilityRole::Retrieval).len(), 1);
    }
}

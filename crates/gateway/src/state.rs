use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use sa_domain::config::Config;
use sa_memory::provider::SerialMemoryProvider;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::{IdentityResolver, LifecycleManager, SessionStore, TranscriptWriter};
use sa_skills::registry::SkillsRegistry;
use sa_mcp_client::McpManager;
use sa_tools::ProcessManager;

use crate::api::inbound::DedupeStore;
use crate::nodes::registry::NodeRegistry;
use crate::nodes::router::ToolRouter;
use crate::runtime::agent::AgentManager;
use crate::runtime::approval::ApprovalStore;
use crate::runtime::cancel::CancelMap;
use crate::runtime::deliveries::DeliveryStore;
use crate::runtime::quota::QuotaTracker;
use crate::runtime::runs::RunStore;
use crate::runtime::schedules::ScheduleStore;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::tasks::{TaskRunner, TaskStore};
use crate::skills::SkillEngine;
use crate::workspace::bootstrap::BootstrapTracker;
use crate::workspace::files::WorkspaceReader;

/// Cached user facts with a TTL.
#[derive(Clone)]
pub struct CachedUserFacts {
    pub content: String,
    pub fetched_at: Instant,
}

/// Cached tool definitions keyed on (node generation, policy fingerprint).
#[derive(Clone)]
pub struct CachedToolDefs {
    pub defs: Arc<Vec<sa_domain::tool::ToolDefinition>>,
    pub generation: u64,
    pub policy_key: String,
}

/// Live state for the smart router: the default profile, per-tier model
/// lists, the embedding classifier (absent if disabled or unreachable at
/// startup), and a ring buffer of recent routing decisions for
/// `GET /v1/router/decisions`.
pub struct SmartRouterState {
    pub default_profile: sa_domain::config::RoutingProfile,
    pub classifier: Option<sa_providers::classifier::EmbeddingClassifier>,
    pub tiers: sa_domain::config::TierConfig,
    pub decisions: sa_providers::decisions::DecisionLog,
}

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, memory, LLM providers
/// - **Session management** — sessions, identity, lifecycle, transcripts
/// - **Context & skills** — workspace, skills, bootstrap, skill engine
/// - **Runtime** — runs, schedules, deliveries, agents, processes
/// - **Nodes & tools** — node registry, tool router, cancel map
/// - **Security & caching** — token hashes, command deny list, caches
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub memory: Arc<dyn SerialMemoryProvider>,
    pub llm: Arc<ProviderRegistry>,
    /// Embedding-based model-tier router. `None` when `[llm.router]` is
    /// absent or `enabled = false`.
    pub smart_router: Option<Arc<SmartRouterState>>,

    // ── Session management ────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub identity: Arc<IdentityResolver>,
    pub lifecycle: Arc<LifecycleManager>,
    pub transcripts: Arc<TranscriptWriter>,
    pub session_locks: Arc<SessionLockMap>,

    // ── Context & skills ──────────────────────────────────────────────
    pub skills: Arc<SkillsRegistry>,
    pub workspace: Arc<WorkspaceReader>,
    pub bootstrap: Arc<BootstrapTracker>,
    /// Callable skill engine (web.fetch, etc.).
    pub skill_engine: Arc<SkillEngine>,

    // ── Runtime ───────────────────────────────────────────────────────
    /// Run execution tracker.
    pub run_store: Arc<RunStore>,
    /// Schedule store (cron jobs).
    pub schedule_store: Arc<ScheduleStore>,
    /// Delivery store (inbox notifications from scheduled runs).
    pub delivery_store: Arc<DeliveryStore>,
    /// Sub-agent manager. `None` if no agents are configured.
    pub agents: Option<Arc<AgentManager>>,
    pub processes: Arc<ProcessManager>,
    pub cancel_map: Arc<CancelMap>,
    /// Per-agent daily usage/cost limits.
    pub quota_tracker: Arc<QuotaTracker>,
    /// Scheduled/background task bookkeeping (distinct from the team task
    /// list — this one tracks schedule-runner jobs, not team work items).
    pub task_store: Arc<TaskStore>,
    pub task_runner: Arc<TaskRunner>,

    // ── MCP (Model Context Protocol) servers ────────────────────────────
    /// MCP server connections and tool registry.
    pub mcp: Arc<McpManager>,

    // ── Nodes & tools ─────────────────────────────────────────────────
    pub nodes: Arc<NodeRegistry>,
    pub tool_router: Arc<ToolRouter>,

    // ── Inbound ───────────────────────────────────────────────────────
    /// Idempotency store for inbound event deduplication.
    pub dedupe: Arc<DedupeStore>,

    // ── Admin & import ────────────────────────────────────────────────
    /// Path to the loaded config file (for `config reload` / diagnostics).
    pub config_path: PathBuf,
    /// Root directory for import staging (e.g. `./data/import`).
    pub import_root: PathBuf,
    /// Signaled once to begin graceful shutdown (SIGTERM/SIGINT handler).
    pub shutdown_tx: Arc<tokio::sync::Notify>,

    // ── Hooks, team coordination, observable event stream ───────────────
    /// Named-event hook dispatcher shared by the tool scheduler and the
    /// team manager's idle/completion gates.
    pub hooks: Arc<sa_hooks::Dispatcher>,
    /// The registry backing `hooks`, exposed separately so declarative
    /// config registrations and scoped skill/agent registrations can be
    /// added after construction.
    pub hook_registry: Arc<sa_hooks::HookRegistry>,
    /// Single-active-team-per-process coordination layer. `None` members
    /// are spawned lazily via `create_team`.
    pub team: Arc<sa_team::TeamManager>,
    /// Best-effort sink for the observable agent-loop event taxonomy
    /// (system_init, assistant deltas, tool progress, hook events, the
    /// terminal result record). Distinct from the per-run `TurnEvent` SSE
    /// channel: this one carries the full cross-cutting taxonomy for
    /// external observers (dashboards, log shippers).
    pub events: tokio::sync::broadcast::Sender<sa_domain::events::Event>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the admin bearer token (read once at startup).
    /// `None` = dev mode (admin endpoints accessible without auth).
    pub admin_token_hash: Option<Vec<u8>>,
    /// Precompiled exec denied-pattern regexes (compiled once at startup).
    pub denied_command_set: Arc<regex::RegexSet>,
    /// Precompiled exec approval-pattern regexes (compiled once at startup).
    pub approval_command_set: Arc<regex::RegexSet>,
    /// Pending exec approvals awaiting human decision.
    pub approval_store: Arc<ApprovalStore>,

    // ── Caches ────────────────────────────────────────────────────────
    /// Per-user TTL cache for user facts (avoids network calls every turn).
    pub user_facts_cache: Arc<RwLock<HashMap<String, CachedUserFacts>>>,
    /// Cached tool definitions keyed on policy fingerprint; invalidated by
    /// node registry generation counter.
    pub tool_defs_cache: Arc<RwLock<HashMap<String, CachedToolDefs>>>,
}

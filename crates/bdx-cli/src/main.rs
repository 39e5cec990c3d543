// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{bail, Context, Result};
use bdx_core::{
    AssetInstanceId, AssetParamsValue, AssetSlug, FanoutMode, IngestKind, PostId, UserId,
};
use bdx_engine::Engine;
use bdx_ingest::{FollowersSync, FollowingsSync, PostsSync};
use bdx_registry::Registry;
use bdx_resolver::{ResolveOutcome, Resolver};
use bdx_runloop::run_once;
use bdx_store::{IngestRequirement, ParamsKey, PgStore, Store, UserUpsert};
use bdx_telemetry::{LogFormat, MetricsCollector};
use bdx_upstream::{ReqwestUpstreamClient, UpstreamClient};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;

/// Exit code for runtime errors (upstream failures, store errors, validation
/// errors surfaced from the engine).
const EXIT_RUNTIME_ERROR: i32 = 1;
/// Exit code for malformed arguments clap itself didn't already reject.
const EXIT_USAGE_ERROR: i32 = 2;

/// A requirement's freshness floor when the operator asks for an ingest to
/// run right now: always stale, so `Resolver::decide_mode` never skips it.
const FORCE_FRESHNESS_MS: i64 = 0;

#[derive(Parser, Debug)]
#[command(name = "bdx", version, about = "Operator CLI for the birdex asset materialization engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit JSON log lines instead of pretty-printed ones.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage asset instance roots.
    #[command(subcommand)]
    AssetsRoots(AssetsRootsCommands),

    /// Manage asset instance fanout roots.
    #[command(subcommand)]
    AssetsFanoutRoots(AssetsFanoutRootsCommands),

    /// Run the planner/engine.
    #[command(subcommand)]
    Worker(WorkerCommands),

    /// Run a single ingest directly, bypassing the tick loop.
    #[command(subcommand)]
    Ingest(IngestCommands),
}

#[derive(Subcommand, Debug)]
enum AssetsRootsCommands {
    /// Enable a root, creating its params/instance rows if needed.
    Enable {
        /// Enable an already-existing instance by id.
        #[arg(long, conflicts_with_all = ["slug", "params"])]
        instance_id: Option<i64>,

        /// Asset slug to create an instance for (ignored with `--instance-id`).
        #[arg(long, requires = "params")]
        slug: Option<AssetSlug>,

        /// Params value as JSON, tagged by `asset_slug` (ignored with
        /// `--instance-id`). Mutually exclusive with `--specified-user-ids`.
        #[arg(long, conflicts_with = "specified_user_ids")]
        params: Option<String>,

        /// Convenience form of `segment_specified_users` params: a
        /// comma-separated list of user ids. Requires `--stable-key`.
        #[arg(long, requires = "stable_key")]
        specified_user_ids: Option<String>,

        /// Stable identity key for `--specified-user-ids`.
        #[arg(long)]
        stable_key: Option<String>,
    },
    /// Disable a root. Idempotent.
    Disable {
        /// Instance id the root belongs to.
        #[arg(long)]
        instance_id: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FanoutModeArg {
    GlobalPerItem,
    ScopedBySource,
}

impl From<FanoutModeArg> for FanoutMode {
    fn from(v: FanoutModeArg) -> Self {
        match v {
            FanoutModeArg::GlobalPerItem => FanoutMode::GlobalPerItem,
            FanoutModeArg::ScopedBySource => FanoutMode::ScopedBySource,
        }
    }
}

#[derive(Subcommand, Debug)]
enum AssetsFanoutRootsCommands {
    /// Enable a fanout root.
    Enable {
        /// Source instance id the fanout expands from.
        #[arg(long)]
        source_instance_id: i64,
        /// Slug every expanded target instance materializes.
        #[arg(long)]
        target_slug: AssetSlug,
        /// Whether derived instances are shared globally or scoped to the
        /// source instance.
        #[arg(long, value_enum)]
        fanout_mode: FanoutModeArg,
    },
    /// Disable a fanout root. Idempotent.
    Disable {
        #[arg(long)]
        source_instance_id: i64,
        #[arg(long)]
        target_slug: AssetSlug,
        #[arg(long, value_enum)]
        fanout_mode: FanoutModeArg,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Run exactly one engine tick.
    Tick,
}

#[derive(Subcommand, Debug)]
enum IngestCommands {
    /// Sync one user's followers.
    Followers {
        #[arg(long)]
        user_id: i64,
    },
    /// Sync one user's followings.
    Followings {
        #[arg(long)]
        user_id: i64,
    },
    /// Sync posts authored by a batch of users.
    Posts {
        /// Comma-separated author user ids.
        #[arg(long)]
        user_ids: String,
    },
    /// Batch-fetch and upsert user profiles by id.
    Users {
        /// Comma-separated user ids.
        #[arg(long)]
        user_ids: String,
    },
    /// Batch-fetch and upsert posts by id.
    PostsByIds {
        /// Comma-separated post ids.
        #[arg(long)]
        post_ids: String,
    },
}

fn parse_csv_i64(raw: &str, flag: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().with_context(|| format!("{flag} value {s:?} is not an integer")))
        .collect()
}

/// Everything a command needs to talk to the store, the upstream provider,
/// and the planner. Built once per invocation from the process environment.
struct CliContext {
    config: bdx_config::EngineConfig,
    store: Arc<dyn Store>,
    client: Arc<dyn UpstreamClient>,
    registry: Arc<Registry>,
}

impl CliContext {
    async fn load() -> Result<Self> {
        let config = bdx_config::load().context("load configuration")?;

        let store: Arc<dyn Store> = Arc::new(
            PgStore::connect(
                &config.database.url,
                config.database.max_connections,
                config.database.acquire_timeout_ms,
                config.database.run_migrations,
            )
            .await
            .context("connect to database")?,
        );

        let min_interval_ms = (1000.0 / config.upstream.rate_limit_qps).round() as u64;
        let rate_limiter = bdx_ratelimit::RateLimiter::with_min_interval_ms(min_interval_ms);
        let client: Arc<dyn UpstreamClient> = Arc::new(ReqwestUpstreamClient::new(
            config.upstream.base_url.clone(),
            config.upstream.bearer_token.clone(),
            rate_limiter,
            config.retention.http_body_max_bytes,
        ));

        let registry = Arc::new(Registry::with_builtin_assets().context("builtin asset registry is acyclic")?);

        Ok(Self { config, store, client, registry })
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(
            self.store.clone(),
            FollowersSync::new(self.client.clone(), self.store.clone()),
            FollowingsSync::new(self.client.clone(), self.store.clone()),
            PostsSync::new(self.client.clone(), self.store.clone(), self.config.upstream.max_query_length),
        )
        .with_lock_timing(
            std::time::Duration::from_millis(self.config.ingest_lock.timeout_ms),
            std::time::Duration::from_millis(self.config.ingest_lock.poll_interval_ms),
        )
    }

    fn engine(&self) -> Arc<Engine> {
        Arc::new(
            Engine::new(self.store.clone(), self.registry.clone(), Arc::new(self.resolver()))
                .with_max_parallel_instances(self.config.engine.max_parallel_instances as usize),
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    bdx_telemetry::init_tracing(if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty });

    let result = run(cli.command).await;
    match result {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::AssetsRoots(cmd) => cmd_assets_roots(cmd).await,
        Commands::AssetsFanoutRoots(cmd) => cmd_assets_fanout_roots(cmd).await,
        Commands::Worker(WorkerCommands::Tick) => cmd_worker_tick().await,
        Commands::Ingest(cmd) => cmd_ingest(cmd).await,
    }
}

async fn cmd_assets_roots(cmd: AssetsRootsCommands) -> Result<()> {
    let ctx = CliContext::load().await?;

    match cmd {
        AssetsRootsCommands::Enable { instance_id, slug, params, specified_user_ids, stable_key } => {
            let instance = if let Some(raw_id) = instance_id {
                ctx.store.get_asset_instance(AssetInstanceId(raw_id)).await.context("look up asset instance")?
            } else {
                let value = if let Some(raw_ids) = specified_user_ids {
                    let ids: Vec<UserId> = parse_csv_i64(&raw_ids, "--specified-user-ids")?.into_iter().map(UserId).collect();
                    seed_users_by_ids(&ctx, &ids).await.context("seed specified users")?;
                    AssetParamsValue::SegmentSpecifiedUsers {
                        stable_key: stable_key.expect("clap requires stable_key with specified_user_ids"),
                        specified_user_ids: ids,
                        fanout_source_params_hash: None,
                    }
                } else {
                    let Some(raw_params) = params else {
                        std::process::exit(EXIT_USAGE_ERROR);
                    };
                    serde_json::from_str::<AssetParamsValue>(&raw_params).context("parse --params as JSON")?
                };

                if let Some(slug) = slug {
                    if value.asset_slug() != slug {
                        bail!("--slug {slug} does not match the asset_slug tag in --params ({})", value.asset_slug());
                    }
                }

                let params_row = ctx
                    .store
                    .get_or_create_asset_params(ParamsKey {
                        asset_slug: value.asset_slug(),
                        params_hash: bdx_hash::params_hash(&value),
                        params_hash_version: bdx_hash::PARAMS_HASH_VERSION,
                        value,
                    })
                    .await
                    .context("get or create asset params")?;
                ctx.store.get_or_create_asset_instance(params_row.id).await.context("get or create asset instance")?
            };

            let root_id = ctx.store.upsert_root(instance.id, false).await.context("enable root")?;
            println!(
                "{}",
                serde_json::json!({ "root_id": root_id.get(), "instance_id": instance.id.get() })
            );
            Ok(())
        }
        AssetsRootsCommands::Disable { instance_id } => {
            ctx.store.upsert_root(AssetInstanceId(instance_id), true).await.context("disable root")?;
            println!("disabled");
            Ok(())
        }
    }
}

async fn cmd_assets_fanout_roots(cmd: AssetsFanoutRootsCommands) -> Result<()> {
    let ctx = CliContext::load().await?;
    match cmd {
        AssetsFanoutRootsCommands::Enable { source_instance_id, target_slug, fanout_mode } => {
            let fanout_root_id = ctx
                .store
                .upsert_fanout_root(AssetInstanceId(source_instance_id), target_slug, fanout_mode.into(), false)
                .await
                .context("enable fanout root")?;
            println!("{}", serde_json::json!({ "fanout_root_id": fanout_root_id.get() }));
            Ok(())
        }
        AssetsFanoutRootsCommands::Disable { source_instance_id, target_slug, fanout_mode } => {
            let fanout_root_id = ctx
                .store
                .upsert_fanout_root(AssetInstanceId(source_instance_id), target_slug, fanout_mode.into(), true)
                .await
                .context("disable fanout root")?;
            println!("{}", serde_json::json!({ "fanout_root_id": fanout_root_id.get() }));
            Ok(())
        }
    }
}

async fn cmd_worker_tick() -> Result<()> {
    let ctx = CliContext::load().await?;
    let engine = ctx.engine();
    let collector = MetricsCollector::new();
    let summary = run_once(&engine, &collector).await.map_err(|err| anyhow::anyhow!("{err}"))?;
    println!(
        "{}",
        serde_json::json!({
            "tick_id": summary.tick_id,
            "materialized": summary.materialized,
            "short_circuited": summary.short_circuited,
            "deferred": summary.deferred,
            "skipped": summary.skipped,
            "validation_warnings": summary.validation_warnings,
            "validation_errors": summary.validation_errors,
            "errors": summary.errors,
        })
    );
    if summary.errors > 0 {
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
    Ok(())
}

/// Batch-fetch and upsert profiles for `ids`, returning the upserted user
/// ids. Shared by `assets roots enable --specified-user-ids`, which needs
/// real `User` rows for a segment the registry never requests an ingest
/// for, and `ingest users`.
async fn seed_users_by_ids(ctx: &CliContext, ids: &[UserId]) -> Result<Vec<i64>> {
    let profiles = ctx
        .client
        .fetch_users_by_ids(ids, ctx.config.upstream.batch_users_by_ids_max)
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let mut upserted = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let outcome = ctx
            .store
            .upsert_user(UserUpsert { id: profile.id, handle: profile.handle, ingest_event_id: None })
            .await
            .context("upsert user")?;
        upserted.push(outcome.user.id.get());
    }
    Ok(upserted)
}

fn print_resolve_outcome(outcome: &ResolveOutcome) {
    match outcome {
        ResolveOutcome::Synced(sync) => println!(
            "{}",
            serde_json::json!({ "ingest_event_id": sync.ingest_event_id.get(), "cursor_exhausted": sync.cursor_exhausted })
        ),
        ResolveOutcome::Deferred => println!("{}", serde_json::json!({ "deferred": true })),
    }
}

async fn cmd_ingest(cmd: IngestCommands) -> Result<()> {
    let ctx = CliContext::load().await?;

    match cmd {
        IngestCommands::Followers { user_id } => {
            let resolver = ctx.resolver();
            let outcome = resolver
                .resolve_one(&IngestRequirement {
                    kind: IngestKind::TwitterioApiUserFollowers,
                    target_user_id: UserId(user_id),
                    freshness_ms: FORCE_FRESHNESS_MS,
                    requested_by_materialization_id: None,
                })
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            print_resolve_outcome(&outcome);
            Ok(())
        }
        IngestCommands::Followings { user_id } => {
            let resolver = ctx.resolver();
            let outcome = resolver
                .resolve_one(&IngestRequirement {
                    kind: IngestKind::TwitterioApiUserFollowings,
                    target_user_id: UserId(user_id),
                    freshness_ms: FORCE_FRESHNESS_MS,
                    requested_by_materialization_id: None,
                })
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            print_resolve_outcome(&outcome);
            Ok(())
        }
        IngestCommands::Posts { user_ids } => {
            let ids: Vec<UserId> = parse_csv_i64(&user_ids, "--user-ids")?.into_iter().map(UserId).collect();
            let posts = PostsSync::new(ctx.client.clone(), ctx.store.clone(), ctx.config.upstream.max_query_length);
            let outcomes = posts.run(&ids, bdx_core::SyncMode::FullRefresh).await.map_err(|err| anyhow::anyhow!("{err}"))?;
            let summary: Vec<_> = outcomes
                .iter()
                .map(|o| serde_json::json!({ "ingest_event_id": o.ingest_event_id.get(), "cursor_exhausted": o.cursor_exhausted }))
                .collect();
            println!("{}", serde_json::Value::Array(summary));
            Ok(())
        }
        IngestCommands::Users { user_ids } => {
            let ids: Vec<UserId> = parse_csv_i64(&user_ids, "--user-ids")?.into_iter().map(UserId).collect();
            let upserted = seed_users_by_ids(&ctx, &ids).await?;
            println!("{}", serde_json::json!({ "upserted": upserted }));
            Ok(())
        }
        IngestCommands::PostsByIds { post_ids } => {
            let ids: Vec<PostId> = parse_csv_i64(&post_ids, "--post-ids")?.into_iter().map(PostId).collect();
            let posts = ctx
                .client
                .fetch_posts_by_ids(&ids, ctx.config.upstream.batch_posts_by_ids_max)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            let mut upserted = Vec::with_capacity(posts.len());
            for post in posts {
                let stored = ctx
                    .store
                    .upsert_post(bdx_core::Post {
                        id: post.id,
                        author_id: post.author_id,
                        posted_at: post.posted_at,
                        text: post.text,
                        lang: post.lang,
                        raw_payload: post.raw,
                        is_deleted: false,
                    })
                    .await
                    .context("upsert post")?;
                upserted.push(stored.id.get());
            }
            println!("{}", serde_json::json!({ "upserted": upserted }));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_i64_trims_and_skips_blanks() {
        assert_eq!(parse_csv_i64("1, 2,3 ,,4", "--ids").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn parse_csv_i64_rejects_non_integer_values() {
        let err = parse_csv_i64("1,abc", "--user-ids").unwrap_err();
        assert!(err.to_string().contains("--user-ids"));
    }

    #[test]
    fn parse_csv_i64_empty_string_is_empty_vec() {
        assert_eq!(parse_csv_i64("", "--ids").unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn fanout_mode_arg_converts_to_core_fanout_mode() {
        assert_eq!(FanoutMode::from(FanoutModeArg::GlobalPerItem), FanoutMode::GlobalPerItem);
        assert_eq!(FanoutMode::from(FanoutModeArg::ScopedBySource), FanoutMode::ScopedBySource);
    }

    #[test]
    fn cli_parses_roots_enable_with_specified_user_ids() {
        let cli = Cli::try_parse_from([
            "bdx",
            "assets-roots",
            "enable",
            "--specified-user-ids",
            "1,2,3",
            "--stable-key",
            "vips",
        ])
        .unwrap();
        match cli.command {
            Commands::AssetsRoots(AssetsRootsCommands::Enable { specified_user_ids, stable_key, .. }) => {
                assert_eq!(specified_user_ids, Some("1,2,3".to_string()));
                assert_eq!(stable_key, Some("vips".to_string()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_instance_id_combined_with_slug() {
        let err = Cli::try_parse_from([
            "bdx",
            "assets-roots",
            "enable",
            "--instance-id",
            "1",
            "--slug",
            "segment_followers",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}

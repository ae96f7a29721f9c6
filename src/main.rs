use std::path::PathBuf;
use std::time::Duration;
use stratum::cli::{Cli, Commands, ConfigAction};
use stratum::config::{Config, ConfigValidator};
use stratum::error::{Result, StratumError};
use stratum::hierarchy::{
    flat_index_dir, HierarchicalIndex, RebuildRecord, RebuildResult, RebuildStatus,
};
use stratum::retrieval::{RetrieverKindChoice, SearchConfig};
use stratum::service::{RetrievalEngine, SearchOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Search {
            query,
            kb,
            top_k,
            kind,
            threshold,
            json,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_search(config, &query, &kb, top_k, kind, threshold, json).await?;
        }
        Commands::Rebuild {
            kb,
            force,
            background,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_rebuild(config, &kb, force, background).await?;
        }
        Commands::Status { kb } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_status(config, kb.as_deref())?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, cli.profile, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "stratum=debug" } else { "stratum=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn cmd_search(
    config: Config,
    query: &str,
    kb_ids: &[String],
    top_k: Option<usize>,
    kind: Option<RetrieverKindChoice>,
    threshold: Option<f32>,
    json: bool,
) -> Result<()> {
    let mut params: SearchConfig = config.search.clone();
    if let Some(kind) = kind {
        params.retriever_kind = kind;
    }
    if let Some(threshold) = threshold {
        params.score_threshold = threshold;
    }
    let top_k = top_k.unwrap_or(params.top_k);

    let engine = RetrievalEngine::new(config)?;
    let outcome = engine.search(query, kb_ids, top_k, &params).await?;

    if json {
        let out = serde_json::to_string_pretty(&outcome).map_err(|e| StratumError::Json {
            source: e,
            context: "Failed to serialize search outcome".to_string(),
        })?;
        println!("{}", out);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &SearchOutcome) {
    if let Some(reason) = &outcome.reason {
        println!("No results: {}", reason);
        return;
    }

    let via = if outcome.used_source_fallback {
        "source_fallback".to_string()
    } else {
        outcome
            .retriever
            .map(|k| k.to_string())
            .unwrap_or_else(|| "none".to_string())
    };
    println!("{} results via {}", outcome.hits.len(), via);
    for path in &outcome.paths {
        let state = if path.timed_out { " (timed out)" } else { "" };
        println!("  path {:<16} {:>3} hits  {}{}", path.name, path.hits, path.query, state);
    }
    println!();

    for (rank, hit) in outcome.hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({})",
            rank + 1,
            hit.score,
            hit.id(),
            hit.fragment.source().unwrap_or("unknown")
        );
        let shown = hit
            .fragment
            .metadata
            .get("highlighted_content")
            .and_then(|v| v.as_str())
            .unwrap_or(hit.content());
        for line in shown.lines().take(6) {
            println!("   {}", line);
        }
    }
}

async fn cmd_rebuild(config: Config, kb: &str, force: bool, background: bool) -> Result<()> {
    let engine = RetrievalEngine::new(config)?;

    let result = if background {
        let job_id = engine.spawn_rebuild(kb, force)?;
        println!("Rebuild {} started for '{}'", job_id, kb);
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let RebuildStatus::Finished { result, .. } = engine.rebuild_status(kb) {
                break result;
            }
        }
    } else if force {
        engine.force_rebuild(kb).await
    } else {
        engine.rebuild_hierarchical_index(kb).await
    };

    print_rebuild(kb, &result);
    if result.success {
        Ok(())
    } else {
        Err(StratumError::Other(anyhow::anyhow!(
            "rebuild of '{}' failed: {}",
            kb,
            result.message
        )))
    }
}

fn print_rebuild(kb: &str, result: &RebuildResult) {
    let mark = if result.success { "✓" } else { "✗" };
    println!("{} {}: {} ({})", mark, kb, result.action.as_str(), result.message);
}

fn cmd_status(config: Config, only: Option<&str>) -> Result<()> {
    let engine = RetrievalEngine::new(config)?;
    let registry = engine.registry();

    let entries: Vec<_> = registry
        .entries()
        .iter()
        .filter(|kb| only.map_or(true, |id| kb.id == id))
        .collect();
    if entries.is_empty() {
        match only {
            Some(id) => return Err(StratumError::KnowledgeBaseNotFound { id: id.to_string() }),
            None => println!("No knowledge bases registered"),
        }
        return Ok(());
    }

    for kb in entries {
        let root = registry.kb_root(kb);
        let flat = if stratum::embedding::VectorIndex::exists(&flat_index_dir(&root)) {
            "present"
        } else {
            "missing"
        };
        let hierarchical = if HierarchicalIndex::exists(&root) {
            "present"
        } else {
            "missing"
        };

        println!("{} ({})", kb.id, kb.name);
        println!("  Root:          {}", root.display());
        println!(
            "  Model:         {}",
            kb.embedding_model_id.as_deref().unwrap_or("default")
        );
        println!("  Flat index:    {}", flat);
        println!("  Hierarchical:  {}", hierarchical);
        match RebuildRecord::load(&root) {
            Some(record) => println!(
                "  Last rebuild:  {} ({} fragments)",
                record.last_rebuild_datetime, record.doc_count
            ),
            None => println!("  Last rebuild:  never"),
        }
    }
    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, profile)?;
            let value = serde_json::to_value(&config).map_err(|e| StratumError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;

            let shown = match section {
                Some(section) => value.get(&section).cloned().ok_or_else(|| {
                    StratumError::Config(format!("Unknown config section: {}", section))
                })?,
                None => value,
            };
            let json = serde_json::to_string_pretty(&shown).map_err(|e| StratumError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;
            println!("{}", json);
        }
        ConfigAction::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            ConfigValidator::validate(&config)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StratumError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'stratum config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        return Ok(config);
    }

    match profile {
        Some(profile) => Config::load_with_profile(&path, &profile),
        None => Config::load(&path),
    }
}

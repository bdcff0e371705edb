use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use dbwatch::model::{EndpointKind, Instance, Series};
use dbwatch::query::{self, RequestDescriptor};
use dbwatch::state::{StatePath, Store};
use dbwatch::{Config, Dashboard, Poller, SampleBudget, ViewPatch, ViewState};
use miette::{IntoDiagnostic, miette};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[clap(long, global = true, help = "Path to the configuration file")]
    config: Option<PathBuf>,
    #[clap(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
enum Commands {
    #[command(about = "List monitored instances and the databases of the active one")]
    Instances,
    #[command(about = "Print the requests the current view would send, without sending them")]
    Query(QueryArgs),
    #[command(about = "Discover instances, then poll and log every endpoint")]
    Watch(ViewArgs),
}

#[derive(clap::Args, Clone, Debug, Default)]
struct ViewArgs {
    #[clap(long, value_parser = parse_millis, help = "Trailing timeframe, e.g. 15m or 2h")]
    timeframe: Option<u64>,
    #[clap(long, value_parser = parse_millis, help = "Sample interval, e.g. 10s")]
    interval: Option<u64>,
    #[clap(long, help = "Activity cube grouping dimension")]
    group: Option<String>,
    #[clap(long, help = "Activity cube legend dimension")]
    legend: Option<String>,
    #[clap(long, requires = "filter_value", help = "Dimension to filter the cube on")]
    filter_dim: Option<String>,
    #[clap(long, requires = "filter_dim", help = "Value the filter dimension must match")]
    filter_value: Option<String>,
    #[clap(long, help = "Zoom window in percent of the timeframe, e.g. 50..100")]
    range: Option<Zoom>,
    #[clap(long, help = "Instance to select, by db identifier")]
    instance: Option<String>,
}

#[derive(clap::Args, Clone, Debug)]
struct QueryArgs {
    #[command(flatten)]
    view: ViewArgs,
    #[clap(long, value_delimiter = ',', help = "Databases of the instance")]
    databases: Vec<String>,
    #[clap(long, help = "Server clock in epoch milliseconds, needed for zoomed windows")]
    server_now: Option<u64>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// `BEGIN..END` selection, both ends in `[0, 100]`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Zoom {
    begin: f64,
    end: f64,
}

impl FromStr for Zoom {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (begin, end) = s
            .split_once("..")
            .ok_or_else(|| format!("expected BEGIN..END, got {s:?}"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<f64>()
                .map_err(|err| format!("invalid percentage {v:?}: {err}"))
        };
        let (begin, end) = (parse(begin)?, parse(end)?);
        if !(0.0..=100.0).contains(&begin) || !(0.0..=100.0).contains(&end) {
            return Err("percentages must be within 0..100".to_string());
        }
        if begin >= end {
            return Err(format!("empty range {begin}..{end}"));
        }
        Ok(Zoom { begin, end })
    }
}

fn parse_millis(s: &str) -> Result<u64, String> {
    let span: jiff::Span = s.parse().map_err(|err| format!("{err}"))?;
    let millis = span
        .total((
            jiff::Unit::Millisecond,
            jiff::SpanRelativeTo::days_are_24_hours(),
        ))
        .map_err(|err| format!("{err}"))?;
    if millis < 1.0 {
        return Err(format!("{s:?} must be at least 1ms"));
    }
    Ok(millis.round() as u64)
}

impl ViewArgs {
    fn patch(&self) -> ViewPatch {
        let mut patch = ViewPatch::new();
        if let Some(timeframe) = self.timeframe {
            patch = patch.timeframe_ms(timeframe);
        }
        if let Some(interval) = self.interval {
            patch = patch.interval_ms(interval);
        }
        if let Some(group) = &self.group {
            patch = patch.group_dimension(group);
        }
        if let Some(legend) = &self.legend {
            patch = patch.legend_dimension(legend);
        }
        if let (Some(dim), Some(value)) = (&self.filter_dim, &self.filter_value) {
            patch = patch.filter(Some((dim.clone(), value.clone())));
        }
        if let Some(Zoom { begin, end }) = self.range {
            patch = patch.range_pct(begin, end);
        }
        if let Some(id) = &self.instance {
            patch = patch.selected_instance(Some(Instance::new(id)));
        }
        patch
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = Cli::parse();
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::builder().from_env_lossy()
    } else {
        EnvFilter::builder().parse_lossy(format!(
            "dbwatch={level},dbwatch_cli={level}",
            level = args.log_level.as_str()
        ))
    };
    let _ = tracing_subscriber::fmt::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .try_init();

    let config = Config::load(args.config.as_deref()).into_diagnostic()?;
    match args.command {
        Commands::Instances => instances(&config).await,
        Commands::Query(query) => print_queries(&config, &query),
        Commands::Watch(view) => watch(&config, &view).await,
    }
}

async fn instances(config: &Config) -> miette::Result<()> {
    let dashboard = Dashboard::from_config(config).into_diagnostic()?;
    let discovered = dashboard.fetch_instances(false).await;
    let state = dashboard.store().snapshot();
    if state.instances.is_empty() {
        return Err(miette!("no instances listed by {}", config.base_url));
    }
    let selected = state
        .selected_instance
        .as_ref()
        .map(|instance| instance.db_identifier.as_str());

    let mut builder = tabled::builder::Builder::default();
    builder.push_record(["", "INSTANCE", "SYSTEM", "TYPE", "SCOPE"]);
    for instance in &state.instances {
        let active = Some(instance.db_identifier.as_str()) == selected;
        builder.push_record([
            if active { "*" } else { "" }.to_string(),
            instance.db_identifier.clone(),
            instance.system_id.clone().unwrap_or_default(),
            instance.system_type.clone().unwrap_or_default(),
            instance.system_scope.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", styled(builder));
    if !discovered || state.database_list.is_empty() {
        warn!("no databases discovered for the active instance");
    } else {
        println!("databases: {}", state.database_list.join(", "));
    }
    Ok(())
}

fn view_state(config: &Config, query: &QueryArgs) -> ViewState {
    let store = Store::new(config.view_defaults());
    let mut patch = query.view.patch().database_list(query.databases.clone());
    if let Some(server_now) = query.server_now {
        patch = patch.server_now(server_now);
    }
    store.apply(patch);
    store.snapshot()
}

fn describe(
    request: Option<&RequestDescriptor>,
    base_url: &str,
    budget: SampleBudget,
) -> (String, String) {
    let Some(request) = request else {
        return ("not applicable".to_string(), String::new());
    };
    let url = request
        .url(base_url)
        .map(|url| url.to_string())
        .unwrap_or_else(|err| err.to_string());
    let verdict = match request.span {
        Some(span) => match budget.check(span.time_range_ms, span.interval_ms) {
            Ok(samples) => format!("{samples} samples"),
            Err(err) => err.to_string(),
        },
        None => String::new(),
    };
    (url, verdict)
}

fn print_queries(config: &Config, query: &QueryArgs) -> miette::Result<()> {
    let state = view_state(config, query);
    let budget = SampleBudget::new(config.max_samples);
    let mut builder = tabled::builder::Builder::default();
    builder.push_record(["ENDPOINT", "REQUEST", "BUDGET"]);
    for kind in EndpointKind::ALL {
        let request = query::build_query(kind, &state);
        let (url, verdict) = describe(request.as_ref(), &config.base_url, budget);
        builder.push_record([kind.to_string(), url, verdict]);
    }
    if state.cube.filter_dimension.is_some() {
        let request = query::build_filter_options_query(&state);
        let (url, verdict) = describe(request.as_ref(), &config.base_url, budget);
        builder.push_record(["filter options".to_string(), url, verdict]);
    }
    println!("{}", styled(builder));
    Ok(())
}

fn summarize(series: &[Series]) -> (usize, usize) {
    let samples = series.iter().map(|s| s.values.len()).sum();
    (series.len(), samples)
}

async fn watch(config: &Config, view: &ViewArgs) -> miette::Result<()> {
    let dashboard = Dashboard::from_config(config).into_diagnostic()?;
    dashboard.store().apply(view.patch());

    let store = dashboard.store();
    let subscriptions = [
        store.subscribe([StatePath::CubeData], |state| {
            let (series, samples) = summarize(&state.cube.last_cube_data);
            info!(series, samples, server_now = ?state.server_now, "activity");
        }),
        store.subscribe([StatePath::MetricSeries], |state| {
            let (series, samples) = summarize(&state.metric_series);
            info!(series, samples, "metric");
        }),
        store.subscribe([StatePath::PrometheusSeries], |state| {
            let (series, samples) = summarize(&state.prometheus_series);
            info!(series, samples, "prometheus");
        }),
        store.subscribe([StatePath::CubeError], |state| {
            if let Some(message) = &state.cube.last_error {
                warn!(%message, "activity query rejected");
            }
        }),
        store.subscribe([StatePath::Databases], |state| {
            let instance = state
                .selected_instance
                .as_ref()
                .map(|instance| instance.db_identifier.as_str());
            info!(?instance, databases = ?state.database_list, "databases");
        }),
    ];

    let poller = Poller::new(dashboard.clone(), config.poll_interval()).spawn();
    if !dashboard.bootstrap().await {
        warn!(
            delay_ms = config.retry_delay_ms,
            "instance discovery failed, retrying in the background"
        );
    }

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("shutting down");
    poller.shutdown();
    dashboard.shutdown();
    for id in subscriptions {
        store.unsubscribe(id);
    }
    Ok(())
}

fn styled(builder: tabled::builder::Builder) -> tabled::Table {
    let mut table = builder.build();
    table
        .with(tabled::settings::Style::rounded())
        .with(tabled::settings::style::BorderColor::filled(
            tabled::settings::Color::FG_BLUE,
        ));
    table
}

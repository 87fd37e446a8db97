//! CLI binary for fieldscan.
//!
//! A thin shim over the library crate: subcommands map to
//! `ExtractionOrchestrator` / `HistoryStore` calls and print the result.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fieldscan::{
    ExtractionConfig, ExtractionOrchestrator, ExtractionOutcome, ExtractionProgressCallback,
    ExtractionRecord, ExtractionRequest, ExtractionState, FieldMap, PageRasterizer, PageSelection,
    ProgressCallback, RecordId, RecordPatch, SourceDocument,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner that follows one record through its lifecycle.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Uploading");
        bar.set_message("storing document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_record_created(&self, id: RecordId) {
        self.bar.println(format!("{} record {}", cyan("◆"), bold(&id.to_string())));
    }

    fn on_state_change(&self, _id: RecordId, _from: ExtractionState, to: ExtractionState) {
        if to == ExtractionState::Processing {
            self.bar.set_prefix("Extracting");
        }
        self.bar.set_message(to.to_string());
    }

    fn on_page_start(&self, _id: RecordId, page: usize, page_count: usize) {
        self.bar.set_message(format!("page {page} ({page_count} selected)"));
    }

    fn on_page_complete(&self, _id: RecordId, page: usize, field_count: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            green("✓"),
            page,
            dim(&format!("{field_count} field(s)")),
        ));
    }

    fn on_extraction_complete(&self, _id: RecordId, _state: ExtractionState, _error: Option<&str>) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract fields from the first page of a PDF
  fieldscan extract listing.pdf -f "property name,rent,address"

  # All pages, JSON output
  fieldscan extract invoice.pdf -f "invoice number" -f total --pages all --json

  # Browse and correct the history
  fieldscan list --state failed
  fieldscan show 12
  fieldscan edit 12 --set "rent=¥85,000"

  # Retry a failed record with the same fields
  fieldscan reextract 12

  # Page count (no API key needed)
  fieldscan pages listing.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          Bearer credential for the recognition endpoint
  FIELDSCAN_ENDPOINT      Chat-completions URL (default: OpenAI)
  FIELDSCAN_MODEL         Model ID (default: gpt-4.1-mini)
  FIELDSCAN_PROVIDER      edgequake-llm provider instead of the endpoint
                          (anthropic, gemini, ollama, …)
  FIELDSCAN_DB            History database (default: ~/.fieldscan/history.db)
  PDFIUM_LIB_PATH         pdfium library file or the directory containing it
"#;

/// Extract structured fields from scanned documents with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "fieldscan",
    version,
    about = "Extract structured fields from scanned documents with Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// History database file.
    #[arg(long, global = true, env = "FIELDSCAN_DB")]
    db: Option<PathBuf>,

    /// Chat-completions endpoint URL.
    #[arg(long, global = true, env = "FIELDSCAN_ENDPOINT")]
    endpoint: Option<String>,

    /// Vision model ID.
    #[arg(long, global = true, env = "FIELDSCAN_MODEL")]
    model: Option<String>,

    /// API key for the endpoint.
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Use an edgequake-llm provider (anthropic, gemini, ollama, …) instead of the endpoint.
    #[arg(long, global = true, env = "FIELDSCAN_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file containing a custom system prompt (may use `{fields}`).
    #[arg(long, global = true, env = "FIELDSCAN_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max model output tokens per page.
    #[arg(long, global = true, env = "FIELDSCAN_MAX_TOKENS")]
    max_tokens: Option<usize>,

    /// pdfium library file or directory.
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Output JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, global = true, env = "FIELDSCAN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "FIELDSCAN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "FIELDSCAN_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a document and extract fields from it.
    Extract {
        /// PDF, PNG or JPEG file.
        input: PathBuf,

        /// Field name to extract; repeat or comma-separate.
        #[arg(short, long = "field", value_delimiter = ',', required = true)]
        fields: Vec<String>,

        /// Page selection: all, 5, 3-15, or 1,3,5.
        #[arg(long, default_value = "1")]
        pages: PageSelection,
    },

    /// Run the extraction again on a stored record.
    Reextract {
        id: RecordId,

        /// Field names; defaults to those of the previous run.
        #[arg(short, long = "field", value_delimiter = ',')]
        fields: Vec<String>,

        #[arg(long, default_value = "1")]
        pages: PageSelection,
    },

    /// List stored records, newest first.
    List {
        /// Only records in this state.
        #[arg(long)]
        state: Option<ExtractionState>,
    },

    /// Show one record.
    Show {
        id: RecordId,

        /// Include the base64 source document in JSON output.
        #[arg(long)]
        with_source: bool,
    },

    /// Correct field values on a record.
    Edit {
        id: RecordId,

        /// `name=value`; repeatable. An empty value clears the field.
        #[arg(long = "set", value_parser = parse_assignment, required = true)]
        assignments: Vec<(String, String)>,
    },

    /// Delete a record.
    Delete { id: RecordId },

    /// Print the page count of a document.
    Pages { input: PathBuf },
}

fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("field name must not be empty".into());
    }
    Ok((name.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { global, command } = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner provides the feedback that matters; keep INFO logs out of
    // its way unless asked for.
    let show_progress = !global.quiet && !global.no_progress && !global.json;
    let filter = if global.verbose {
        "debug"
    } else if global.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let extracting = matches!(command, Command::Extract { .. } | Command::Reextract { .. });
    let progress: Option<ProgressCallback> = if show_progress && extracting {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&global, progress).await?;
    let store = config.open_store().context("Failed to locate history database")?;

    match command {
        Command::Extract {
            input,
            fields,
            pages,
        } => {
            let document = SourceDocument::open(&input)
                .await
                .with_context(|| format!("Failed to open {}", input.display()))?;
            let orchestrator = ExtractionOrchestrator::new(config, store)?;
            let outcome = orchestrator
                .extract_upload(ExtractionRequest::new(document, fields).pages(pages))
                .await
                .context("Extraction failed")?;
            report_outcome(&global, &outcome)
        }
        Command::Reextract { id, fields, pages } => {
            let orchestrator = ExtractionOrchestrator::new(config, store)?;
            let outcome = orchestrator
                .reextract(id, pages, &fields)
                .await
                .context("Re-extraction failed")?;
            report_outcome(&global, &outcome)
        }
        Command::List { state } => {
            let records = match state {
                Some(state) => store.list_by_state(state).await,
                None => store.list().await,
            }
            .context("Failed to list records")?;
            print_list(&global, records)
        }
        Command::Show { id, with_source } => {
            let mut record = store
                .get(id)
                .await
                .context("Failed to read record")?
                .with_context(|| format!("Record {id} not found"))?;
            if !with_source {
                record.pdf_data = None;
            }
            print_record(&global, &record)
        }
        Command::Edit { id, assignments } => {
            let mut record = store
                .get(id)
                .await
                .context("Failed to read record")?
                .with_context(|| format!("Record {id} not found"))?;
            for (name, value) in assignments {
                if value.is_empty() {
                    record.fields_data.remove(&name);
                } else {
                    record.fields_data.insert(name, value);
                }
            }
            store
                .update_data(id, RecordPatch::new().fields(record.fields_data))
                .await
                .context("Failed to update record")?;
            if !global.quiet {
                eprintln!("{} record {} updated", green("✔"), id);
            }
            Ok(())
        }
        Command::Delete { id } => {
            store.delete(id).await.context("Failed to delete record")?;
            if !global.quiet {
                eprintln!("{} record {} deleted", green("✔"), id);
            }
            Ok(())
        }
        Command::Pages { input } => {
            let document = SourceDocument::open(&input)
                .await
                .with_context(|| format!("Failed to open {}", input.display()))?;
            let count = PageRasterizer::new(&config)
                .page_count(&document)
                .await
                .context("Failed to read document")?;
            if global.json {
                println!("{}", serde_json::json!({ "pages": count }));
            } else {
                println!("{count}");
            }
            Ok(())
        }
    }
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(
    global: &GlobalArgs,
    progress: Option<ProgressCallback>,
) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder();

    if let Some(ref path) = global.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref endpoint) = global.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(ref model) = global.model {
        builder = builder.model(model);
    }
    if let Some(ref key) = global.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref provider) = global.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(n) = global.max_tokens {
        builder = builder.max_tokens(n);
    }
    if let Some(ref db) = global.db {
        builder = builder.database_path(db);
    }
    if let Some(ref lib) = global.pdfium_lib {
        builder = builder.pdfium_lib_path(lib);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

// ── Output ───────────────────────────────────────────────────────────────────

fn report_outcome(global: &GlobalArgs, outcome: &ExtractionOutcome) -> Result<()> {
    if global.json {
        println!(
            "{}",
            serde_json::to_string_pretty(outcome).context("Failed to serialise outcome")?
        );
    } else {
        print_fields(&outcome.fields);
    }

    match &outcome.error {
        None => {
            if !global.quiet {
                eprintln!(
                    "{}  record {}  {} field(s) from page(s) {:?}",
                    green("✔"),
                    bold(&outcome.id.to_string()),
                    outcome.fields.len(),
                    outcome.pages
                );
            }
            Ok(())
        }
        Some(error) => {
            eprintln!("{}  record {} failed", red("✗"), bold(&outcome.id.to_string()));
            bail!("{error}")
        }
    }
}

fn print_fields(fields: &FieldMap) {
    let width = fields.keys().map(|k| k.chars().count()).max().unwrap_or(0);
    for (name, value) in fields {
        let pad = width.saturating_sub(name.chars().count());
        println!("{}{}  {}", name, " ".repeat(pad), value);
    }
}

fn print_list(global: &GlobalArgs, records: Vec<ExtractionRecord>) -> Result<()> {
    if global.json {
        let records: Vec<ExtractionRecord> = records
            .into_iter()
            .map(|mut r| {
                r.pdf_data = None;
                r
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("Failed to serialise records")?
        );
        return Ok(());
    }

    if records.is_empty() {
        if !global.quiet {
            eprintln!("{}", dim("No records."));
        }
        return Ok(());
    }

    println!(
        "{:>5}  {:<10}  {:<24}  {:>6}  {}",
        "ID", "STATE", "UPLOADED", "FIELDS", "FILE"
    );
    for record in &records {
        let state = match record.state {
            ExtractionState::Completed => green(&format!("{:<10}", record.state)),
            ExtractionState::Failed => red(&format!("{:<10}", record.state)),
            _ => cyan(&format!("{:<10}", record.state)),
        };
        println!(
            "{:>5}  {}  {:<24}  {:>6}  {}",
            record.id,
            state,
            record.upload_date,
            record.fields_data.len(),
            record.file_name().unwrap_or("-")
        );
    }
    Ok(())
}

fn print_record(global: &GlobalArgs, record: &ExtractionRecord) -> Result<()> {
    if global.json {
        println!(
            "{}",
            serde_json::to_string_pretty(record).context("Failed to serialise record")?
        );
        return Ok(());
    }

    println!("Record:    {}", record.id);
    println!("State:     {}", record.state);
    println!("Uploaded:  {}", record.upload_date);
    if let Some(name) = record.file_name() {
        println!("File:      {}", name);
    }
    let requested = record.requested_fields();
    if !requested.is_empty() {
        println!("Requested: {}", requested.join(", "));
    }
    if let Some(error) = record.error() {
        println!("Error:     {}", red(error));
    }
    println!();
    print_fields(&record.fields_data);
    Ok(())
}

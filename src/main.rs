use anyhow::Result;
use clap::{Parser, Subcommand};
use querygate::api::{RunRequest, UserContextPayload};
use querygate::config::PipelineConfig;
use querygate::observability::logger::init_tracing;
use querygate::security::guardrail::SqlGuardrail;
use querygate::{QueryService, ResponseEnvelope};
use tracing::info;

#[derive(Parser)]
#[command(name = "querygate")]
#[command(about = "Scoped natural-language analytics query pipeline")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the SQL guardrail on a statement and print the verdict as JSON
    Validate {
        /// SQL text to check
        sql: String,

        /// Comma-separated allowed views
        #[arg(long, value_delimiter = ',')]
        views: Vec<String>,

        /// LIMIT ceiling (default: MAX_RESULT_ROWS or 200)
        #[arg(long)]
        max_rows: Option<u64>,
    },

    /// Run one question through the full pipeline using env configuration
    Ask {
        /// The analytics question in natural language
        question: String,

        #[arg(long)]
        role: String,

        #[arg(long, default_value_t = 0)]
        store_id: i64,

        /// Comma-separated allowed views
        #[arg(long, value_delimiter = ',')]
        views: Vec<String>,

        #[arg(long, default_value = "cli")]
        conversation_id: String,

        #[arg(long, default_value = "local")]
        org_id: String,

        #[arg(long, default_value = "operator")]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = PipelineConfig::from_env();

    match args.command {
        Command::Validate { sql, views, max_rows } => {
            let guardrail = SqlGuardrail::new(max_rows.unwrap_or(config.max_result_rows));
            let verdict = guardrail.validate(&sql, &views);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if !verdict.is_accepted() {
                std::process::exit(1);
            }
        }
        Command::Ask {
            question,
            role,
            store_id,
            views,
            conversation_id,
            org_id,
            user_id,
        } => {
            info!("Question: {}", question);
            let service = QueryService::from_config(&config).await?;
            let request = RunRequest {
                conversation_id,
                question,
                org_id,
                user_id,
                user_context: UserContextPayload {
                    role,
                    store_id,
                    allowed_views: views,
                },
            };

            match service.ask(request, None).await? {
                ResponseEnvelope::Success(response) => {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                ResponseEnvelope::Failure(failure) => {
                    eprintln!("{}", serde_json::to_string_pretty(&failure)?);
                    std::process::exit(2);
                }
            }
        }
    }

    Ok(())
}

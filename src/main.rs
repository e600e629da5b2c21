use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use paysync::application::monitor::{MonitorConfig, ReconciliationMonitor};
use paysync::application::pricing::PricingPreview;
use paysync::application::service::UnifiedPaymentService;
use paysync::application::store::PaymentStateStore;
use paysync::config::Config;
use paysync::domain::gateway::{CardDetails, GatewayStatus, WebhookEvent};
use paysync::domain::payment::{PaymentEvent, PaymentMethod, PaymentState};
use paysync::domain::ports::{ConfirmerRef, GatewayRef, QuoterRef, StateRepositoryBox};
use paysync::domain::pricing::PricingBreakdown;
use paysync::domain::request::{BankDetails, PaymentRequest};
use paysync::infrastructure::http::{HttpBackend, HttpGateway};
use paysync::infrastructure::in_memory::InMemoryStateRepository;
use paysync::infrastructure::sandbox::{SandboxBackend, SandboxGateway};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the price split for a service price
    Quote {
        price: Decimal,

        /// Platform margin percent (defaults to 5)
        #[arg(long)]
        margin: Option<Decimal>,

        /// Compare the local split with the backend quote
        #[arg(long)]
        verify: bool,
    },
    /// Start the payment of an order
    Pay(PayArgs),
    /// Reconcile a stored order with the gateway
    Status {
        #[arg(long)]
        order: String,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Apply a gateway webhook payload read from a JSON file
    Webhook {
        payload: PathBuf,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

#[derive(clap::Args)]
struct PayArgs {
    #[arg(long)]
    order: String,

    #[arg(long)]
    method: PaymentMethod,

    /// Amount in major currency units
    #[arg(long)]
    amount: Decimal,

    #[arg(long)]
    email: String,

    #[arg(long)]
    phone: Option<String>,

    #[arg(long)]
    card_number: Option<String>,

    #[arg(long, default_value = "123")]
    cvc: String,

    #[arg(long, default_value = "12")]
    exp_month: String,

    #[arg(long, default_value = "30")]
    exp_year: String,

    #[arg(long, default_value = "Sandbox Payer")]
    card_holder: String,

    #[arg(long)]
    bank_code: Option<String>,

    /// 0 for natural persons, 1 for companies
    #[arg(long, default_value_t = 0)]
    user_type: u8,

    #[arg(long, default_value = "CC")]
    legal_id_type: String,

    #[arg(long)]
    legal_id: Option<String>,

    #[arg(long)]
    redirect_url: Option<String>,

    /// Keep polling until the payment reaches a final status
    #[arg(long)]
    wait: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[derive(clap::Args)]
struct RuntimeArgs {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// How the built-in sandbox gateway settles asynchronous payments
    #[arg(long, value_enum, default_value_t = SandboxOutcome::Approved)]
    sandbox_outcome: SandboxOutcome,
}

#[derive(Clone, Copy, ValueEnum)]
enum SandboxOutcome {
    Approved,
    Declined,
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paysync=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().into_diagnostic()?;
    let cli = Cli::parse();

    match cli.command {
        Command::Quote {
            price,
            margin,
            verify,
        } => {
            let preview = PricingPreview::new(config.pricing(), build_quoter(&config)?);
            let breakdown = if verify {
                preview.verify_parity(price, margin).await
            } else {
                preview.compute_local(price, margin)
            }
            .into_diagnostic()?;
            print_breakdown(&breakdown);
        }
        Command::Pay(args) => pay(&config, args).await?,
        Command::Status { order, runtime } => {
            let service = build_service(&config, &runtime).await?;
            let outcome = service
                .check_and_update_payment_status(&order)
                .await
                .into_diagnostic()?;
            tracing::info!(order_id = %order, ?outcome, "Status check finished");
            print_state(service.get_state(&order).await.as_ref())?;
        }
        Command::Webhook { payload, runtime } => {
            let raw = std::fs::read_to_string(&payload).into_diagnostic()?;
            let event: WebhookEvent = serde_json::from_str(&raw).into_diagnostic()?;
            let order = event.data.transaction.reference.clone();
            let service = build_service(&config, &runtime).await?;
            let outcome = service.handle_webhook(event).await.into_diagnostic()?;
            tracing::info!(?outcome, "Webhook applied");
            if let Some(order) = order {
                print_state(service.get_state(&order).await.as_ref())?;
            }
        }
    }

    Ok(())
}

async fn pay(config: &Config, args: PayArgs) -> Result<()> {
    let service = Arc::new(build_service(config, &args.runtime).await?);

    let mut request = PaymentRequest::new(&args.order, args.method, args.amount, &args.email);
    request.currency = config.currency.clone();
    request.phone_number = args.phone;
    request.redirect_url = args.redirect_url;
    request.card = args.card_number.map(|number| CardDetails {
        number,
        cvc: args.cvc,
        exp_month: args.exp_month,
        exp_year: args.exp_year,
        card_holder: args.card_holder,
        installments: 1,
    });
    request.bank = args.bank_code.map(|code| BankDetails {
        financial_institution_code: code,
        user_type: args.user_type,
        legal_id_type: args.legal_id_type,
        legal_id: args.legal_id.unwrap_or_default(),
    });

    // Subscribe before initiating so no transition is missed while waiting.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = service.subscribe(&args.order, move |event: &PaymentEvent| {
        let _ = tx.send(event.state().clone());
    });

    let result = service.process_payment(request).await;
    println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);

    let needs_wait = result
        .state
        .as_ref()
        .is_some_and(|state| !state.status.is_terminal());
    if args.wait && result.success && needs_wait {
        let monitor = ReconciliationMonitor::new(
            Arc::clone(&service),
            MonitorConfig {
                poll_interval: config.poll_interval,
            },
        );
        let handle = monitor.watch(&args.order);
        let settled = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
            while let Some(state) = rx.recv().await {
                if state.status.is_terminal() {
                    return Some(state);
                }
            }
            None
        })
        .await;
        handle.stop();
        monitor.shutdown();

        match settled {
            Ok(state) => print_state(state.as_ref())?,
            Err(_) => {
                tracing::warn!(order_id = %args.order, "Gave up waiting for a final status");
                print_state(service.get_state(&args.order).await.as_ref())?;
            }
        }
    }

    subscription.unsubscribe();
    Ok(())
}

async fn build_service(config: &Config, runtime: &RuntimeArgs) -> Result<UnifiedPaymentService> {
    let store = PaymentStateStore::new(build_repository(runtime)?);
    let loaded = store.hydrate().await.into_diagnostic()?;
    if loaded > 0 {
        tracing::info!(loaded, "Loaded stored payment states");
    }

    let gateway: GatewayRef = match &config.gateway_url {
        Some(url) => Arc::new(
            HttpGateway::new(url, &config.checkout_url, &config.public_key).into_diagnostic()?,
        ),
        None => Arc::new(sandbox_gateway(runtime.sandbox_outcome)),
    };
    let confirmer: ConfirmerRef = match &config.backend_url {
        Some(url) => Arc::new(HttpBackend::new(url).into_diagnostic()?),
        None => Arc::new(SandboxBackend::new().with_pricing(config.pricing())),
    };

    Ok(UnifiedPaymentService::new(Arc::new(store), gateway, confirmer))
}

fn build_repository(runtime: &RuntimeArgs) -> Result<StateRepositoryBox> {
    match &runtime.db_path {
        Some(db_path) => open_persistent(db_path),
        None => Ok(Box::new(InMemoryStateRepository::new())),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_persistent(db_path: &Path) -> Result<StateRepositoryBox> {
    use paysync::infrastructure::rocksdb::RocksDBStateRepository;
    let repository = RocksDBStateRepository::open(db_path).into_diagnostic()?;
    Ok(Box::new(repository))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_persistent(_db_path: &Path) -> Result<StateRepositoryBox> {
    eprintln!(
        "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
    );
    Ok(Box::new(InMemoryStateRepository::new()))
}

fn build_quoter(config: &Config) -> Result<Option<QuoterRef>> {
    Ok(match &config.backend_url {
        Some(url) => Some(Arc::new(HttpBackend::new(url).into_diagnostic()?)),
        None => None,
    })
}

fn sandbox_gateway(outcome: SandboxOutcome) -> SandboxGateway {
    let gateway = SandboxGateway::new();
    match outcome {
        SandboxOutcome::Approved => {
            gateway.with_status_script([GatewayStatus::Pending, GatewayStatus::Approved])
        }
        SandboxOutcome::Declined => gateway
            .with_status_script([GatewayStatus::Pending])
            .then_status(GatewayStatus::Declined, "Declined by the sandbox"),
        SandboxOutcome::Pending => gateway.with_status_script([GatewayStatus::Pending]),
    }
}

fn print_breakdown(b: &PricingBreakdown) {
    let rows = [
        ("service_price", b.service_price),
        ("margin_percent", b.margin_percent),
        ("platform_margin", b.platform_margin),
        ("base_amount", b.base_amount),
        ("fee_percent_part", b.fee_percent_part),
        ("fee_fixed", b.fee_fixed),
        ("fee_subtotal", b.fee_subtotal),
        ("fee_tax", b.fee_tax),
        ("total_gateway_cost", b.total_gateway_cost),
        ("gateway_cost_client", b.gateway_cost_client),
        ("gateway_cost_provider", b.gateway_cost_provider),
        ("total_price", b.total_price),
        ("provider_earnings", b.provider_earnings),
        ("platform_earnings", b.platform_earnings),
    ];
    for (name, value) in rows {
        println!("{:<22}{}", name, value.normalize());
    }
}

fn print_state(state: Option<&PaymentState>) -> Result<()> {
    match state {
        Some(state) => println!("{}", serde_json::to_string_pretty(state).into_diagnostic()?),
        None => println!("null"),
    }
    Ok(())
}

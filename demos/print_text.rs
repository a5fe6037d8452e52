use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use catprint_ble::{
    Alignment, BtleAdapter, CatPrinter, DriverConfig, FontBook, PrinterEvent, TextStyle,
};

/// Example: print one line of text on an MXW01 printer
/// - Scans for BLE printers when no address is given
/// - Connects, prints, disconnects
#[derive(Parser, Debug)]
#[command(name = "print_text")]
struct Args {
    /// Text to print
    text: String,

    /// TrueType font file
    #[arg(long)]
    font: PathBuf,

    /// Printer address; scans and picks the first printer when omitted
    #[arg(long)]
    address: Option<String>,

    /// Font size in pixels
    #[arg(long, default_value_t = 48.0)]
    size: f32,

    /// left, center or right
    #[arg(long, default_value = "left")]
    align: Alignment,

    /// Rotate the output by 180 degrees
    #[arg(long)]
    upside_down: bool,

    /// JSON driver config overriding the defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scan duration in seconds
    #[arg(long, default_value_t = 3)]
    scan_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => DriverConfig::from_json_file(path)?,
        None => DriverConfig::default(),
    };

    let adapter = BtleAdapter::new().await?;
    let address = match args.address.clone() {
        Some(address) => address,
        None => {
            println!("Scanning for {} seconds...", args.scan_secs);
            let devices = adapter.scan(Duration::from_secs(args.scan_secs)).await?;
            for d in &devices {
                println!("  id={} address={} name={:?}", d.id, d.address, d.name);
            }
            match devices.into_iter().next() {
                Some(d) => d.address,
                None => {
                    println!("No printer found. Is it powered on and advertising?");
                    return Ok(());
                }
            }
        }
    };

    let mut fonts = FontBook::new();
    fonts.load_ttf("default", &args.font)?;
    let printer = CatPrinter::new(adapter, config)?.with_fonts(fonts);

    let mut events = printer.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PrinterEvent::Status(s) => println!("[status] {}", s),
                PrinterEvent::Failure { kind, detail } => eprintln!("[error] {}: {}", kind, detail),
                PrinterEvent::Completed => println!("[done] print completed"),
            }
        }
    });

    printer.connect(&address).await?;
    let style = TextStyle {
        family: "default".into(),
        size: args.size,
        alignment: args.align,
        upside_down: args.upside_down,
    };
    let result = printer.print_text(&args.text, &style).await;
    printer.disconnect().await?;
    result?;
    Ok(())
}

use std::{
    error::Error,
    fs,
    io::{self, Read},
    path::PathBuf,
    process::ExitCode,
};

use blur_h1::{
    core::config::Config,
    http::{http_date::HttpDateCache, http_request::parse_request},
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blur-h1", version, about = "HTTP/1.1 標頭解析與 HTTP 日期工具")]
struct Cli {
    /// JSON 設定檔路徑
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 解析請求的標頭區段（從檔案或標準輸入讀取）
    Headers { file: Option<PathBuf> },
    /// HTTP 日期轉換
    #[command(subcommand)]
    Date(DateCommand),
}

#[derive(Subcommand)]
enum DateCommand {
    /// 將毫秒時間戳格式化為 RFC 1123 字串
    Format {
        #[arg(allow_hyphen_values = true)]
        millis: i64,
    },
    /// 解析 HTTP 日期，輸出毫秒時間戳
    Parse { value: String },
    /// 輸出目前時間的 HTTP 日期
    Now,
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env()?;

    match cli.command {
        Command::Headers { file } => {
            let input = match file {
                Some(path) => fs::read(path)?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };

            let request = parse_request(&input, config.tokenizer)?;
            println!(
                "{}",
                String::from_utf8_lossy(request.request_line().as_bytes())
            );
            for header in request.headers() {
                println!("{header}");
            }
            if !request.remaining().is_empty() {
                println!("({} bytes after headers)", request.remaining().len());
            }
        }
        Command::Date(cmd) => {
            let cache = HttpDateCache::new(config.date_cache);
            match cmd {
                DateCommand::Format { millis } => println!("{}", cache.format(millis)?),
                DateCommand::Parse { value } => match cache.parse(&value) {
                    Some(millis) => println!("{millis}"),
                    None => return Err(format!("Unparseable HTTP date: {value:?}").into()),
                },
                DateCommand::Now => println!("{}", cache.now()),
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

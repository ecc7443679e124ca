//! CLI entry point for `mimetrust`.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};

use mimetrust::config::{self, Config};
use mimetrust::mime::{ContentTypeHeader, HybridStash, MimeBody};
use mimetrust::pkix::{
    CertValidationProcessor, CertValidationProcessorImpl, Certificate, CertificateValidationResult,
    CertificateValidationType, CrlCacheImpl, Facility, MemoryFetcher, MemoryPolicyStore,
    MemoryTrustedCertStore, OcspCacheImpl, PolicyRef, RevocationCheckKind, RevocationCheckPolicy,
    RevocationCheckPolicyItem, TracingAuditor, TrustedCert, UnavailableOcspClient,
};

#[derive(Parser)]
#[command(
    name = "mimetrust",
    version,
    about = "Inspect MIME multipart bodies and validate certificate paths"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the parts of a MIME body
    Parts {
        /// File holding the body (without the outer headers)
        path: PathBuf,
        /// Outer Content-Type, including the boundary parameter
        #[arg(short = 't', long, value_name = "CONTENT_TYPE")]
        content_type: String,
        #[arg(long)]
        json: bool,
    },
    /// Write the body of one part to a file
    Extract {
        path: PathBuf,
        #[arg(short = 't', long, value_name = "CONTENT_TYPE")]
        content_type: String,
        /// Part ordinal (0 is the first part)
        #[arg(short, long, default_value_t = 0)]
        part: usize,
        #[arg(short, long)]
        output: PathBuf,
        /// Keep the Content-Transfer-Encoding instead of decoding
        #[arg(long)]
        raw: bool,
    },
    /// Validate a certificate against trust anchors
    Verify {
        /// Certificate to validate, then any intermediates (PEM or DER)
        #[arg(required = true)]
        certs: Vec<PathBuf>,
        /// Trust anchor file (PEM or DER); may be repeated
        #[arg(short, long = "anchor", value_name = "FILE")]
        anchors: Vec<PathBuf>,
        /// validate, validatepath or revocation
        #[arg(short, long)]
        level: Option<CertificateValidationType>,
        /// Take the level from [pkix.facilities] in the config file
        #[arg(long, conflicts_with = "level")]
        facility: Option<String>,
        /// Serve a CRL for revocation checks; may be repeated
        #[arg(long = "crl", value_name = "URL=FILE")]
        crls: Vec<String>,
        /// Also trust the platform's root certificates
        #[arg(long)]
        system_anchors: bool,
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Parts {
            path,
            content_type,
            json,
        } => cmd_parts(&path, &content_type, json, &config),
        Commands::Extract {
            path,
            content_type,
            part,
            output,
            raw,
        } => cmd_extract(&path, &content_type, part, &output, raw, &config),
        Commands::Verify {
            certs,
            anchors,
            level,
            facility,
            crls,
            system_anchors,
            json,
        } => cmd_verify(
            &VerifyArgs {
                certs,
                anchors,
                level,
                facility,
                crls,
                system_anchors,
                json,
            },
            &config,
        ),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mimetrust.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mimetrust", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let man = clap_mangen::Man::new(Cli::command());
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::stdout().write_all(&buf)?;
    Ok(())
}

fn open_body(path: &Path, content_type: &str, config: &Config) -> anyhow::Result<MimeBody> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let content_type = ContentTypeHeader::parse_value(content_type)?;
    let stash = HybridStash::new(
        config.stash.memory_limit,
        config::stash_dir(&config.stash),
        "mimetrust",
    );
    let source = BufReader::new(File::open(path)?);
    Ok(MimeBody::new(
        Box::new(stash),
        content_type,
        source,
        config.mime.clone(),
    )?)
}

/// List every part with its headers of interest and body size.
fn cmd_parts(path: &Path, content_type: &str, json: bool, config: &Config) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let start = Instant::now();
    let mut body = open_body(path, content_type, config)?;

    let mut rows = Vec::new();
    let mut ordinal = 0;
    while body.has_part(ordinal)? {
        let size = body.part_actual_content_length(ordinal)?;
        let part = body.part(ordinal)?;
        rows.push((
            ordinal,
            part.content_type().full_value().to_string(),
            part.content_id(true).map(str::to_string),
            part.transfer_encoding().to_string(),
            size,
        ));
        ordinal += 1;
    }
    let elapsed = start.elapsed();

    if json {
        let parts: Vec<serde_json::Value> = rows
            .iter()
            .map(|(ordinal, ct, cid, cte, size)| {
                serde_json::json!({
                    "ordinal": ordinal,
                    "content_type": ct,
                    "content_id": cid,
                    "transfer_encoding": cte,
                    "size": size,
                })
            })
            .collect();
        let output = serde_json::json!({
            "file": path.to_string_lossy(),
            "multipart": body.is_multipart(),
            "boundary": body.boundary(),
            "part_count": rows.len(),
            "parts": parts,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("  {:<20} {}", "File", path.display());
    println!("  {:<20} {}", "Parts", rows.len());
    println!("  {:<20} {:.2?}", "Parse time", elapsed);
    println!();
    println!(
        "  {:<4} {:<40} {:<25} {:<10} {:>10}",
        "#", "Content-Type", "Content-ID", "Encoding", "Size"
    );
    println!("  {}", "-".repeat(93));
    for (ordinal, ct, cid, cte, size) in &rows {
        let ct_trunc: String = ct.chars().take(39).collect();
        let cid_trunc: String = cid.as_deref().unwrap_or("-").chars().take(24).collect();
        println!(
            "  {:<4} {:<40} {:<25} {:<10} {:>10}",
            ordinal,
            ct_trunc,
            cid_trunc,
            cte,
            format_size(*size, BINARY)
        );
    }
    println!();
    Ok(())
}

/// Stream one part body to `output`.
fn cmd_extract(
    path: &Path,
    content_type: &str,
    part: usize,
    output: &Path,
    raw: bool,
    config: &Config,
) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let mut config = config.clone();
    config.mime.raw_parts = raw;
    let mut body = open_body(path, content_type, &config)?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = File::create(output)?;
    let written = std::io::copy(&mut body.part_input_stream(part, true)?, &mut out)?;
    body.close();

    println!(
        "  Wrote part #{part} ({}) to {}",
        format_size(written, BINARY),
        output.display()
    );
    Ok(())
}

struct VerifyArgs {
    certs: Vec<PathBuf>,
    anchors: Vec<PathBuf>,
    level: Option<CertificateValidationType>,
    facility: Option<String>,
    crls: Vec<String>,
    system_anchors: bool,
    json: bool,
}

fn read_certificates(path: &Path) -> anyhow::Result<Vec<Certificate>> {
    let bytes = std::fs::read(path)?;
    let certs = Certificate::from_pem_or_der(&bytes)?;
    if certs.is_empty() {
        anyhow::bail!("No certificate in {}", path.display());
    }
    Ok(certs)
}

/// Validate with an in-memory trust store built from the command line.
///
/// The default revocation policy checks the CRLs named in each
/// certificate, served from `--crl`, and fails closed.
fn cmd_verify(args: &VerifyArgs, config: &Config) -> anyhow::Result<()> {
    let mut path = Vec::new();
    for file in &args.certs {
        path.extend(read_certificates(file)?);
    }

    let certs = Arc::new(MemoryTrustedCertStore::new());
    let mut id = 1;
    for file in &args.anchors {
        for certificate in read_certificates(file)? {
            certs.put(TrustedCert {
                id,
                name: file.display().to_string(),
                certificate,
                trust_anchor: true,
                revocation_policy: PolicyRef::UseDefault,
            });
            id += 1;
        }
    }

    let policies = Arc::new(MemoryPolicyStore::new());
    policies.put(RevocationCheckPolicy {
        id: 1,
        name: "Certificate CRLs".to_string(),
        default_policy: true,
        default_success: false,
        continue_on_server_unavailable: false,
        items: vec![RevocationCheckPolicyItem {
            kind: RevocationCheckKind::CrlFromCertificate,
            url: ".*".to_string(),
            allow_issuer_signature: true,
            trusted_signers: Vec::new(),
        }],
    });

    let fetcher = Arc::new(MemoryFetcher::new());
    for entry in &args.crls {
        let (url, file) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected URL=FILE, got '{entry}'"))?;
        fetcher.insert(url, std::fs::read(file)?);
    }

    let mut pkix = config.pkix.clone();
    pkix.use_default_anchors |= args.system_anchors;
    let crl_cache = Arc::new(CrlCacheImpl::new(fetcher, &pkix));
    let ocsp_cache = Arc::new(OcspCacheImpl::new(Arc::new(UnavailableOcspClient), &pkix));
    let processor =
        CertValidationProcessorImpl::new(certs, policies, crl_cache, ocsp_cache, Vec::new(), pkix)?;

    let facility = args.facility.as_deref().map(Facility::from);
    let requested = match (args.level, &facility) {
        (None, None) => Some(CertificateValidationType::PathValidation),
        (level, _) => level,
    };

    let subject = path[0].subject_dn().to_string();
    let start = Instant::now();
    let verdict = processor.check(
        &path,
        CertificateValidationType::CertificateOnly,
        requested,
        facility.as_ref(),
        &TracingAuditor,
    );
    let elapsed = start.elapsed();

    let (result, detail) = match &verdict {
        Ok(result) => (result.to_string(), None),
        Err(e) => ("INVALID".to_string(), Some(e.to_string())),
    };

    if args.json {
        let output = serde_json::json!({
            "subject": subject,
            "fingerprint": path[0].fingerprint_hex(),
            "not_after": path[0].not_after().to_rfc3339(),
            "result": result,
            "error": detail,
            "elapsed_ms": elapsed.as_millis(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!();
        println!("  {:<20} {}", "Subject", subject);
        println!("  {:<20} {}", "Fingerprint", path[0].fingerprint_hex());
        println!("  {:<20} {}", "Not after", path[0].not_after().format("%Y-%m-%d %H:%M:%S"));
        println!("  {:<20} {}", "Result", result);
        if let Some(detail) = &detail {
            println!("  {:<20} {}", "Reason", detail);
        }
        println!("  {:<20} {:.2?}", "Time", elapsed);
        println!();
    }

    match verdict {
        Ok(CertificateValidationResult::Ok) => Ok(()),
        Ok(other) => anyhow::bail!("Certificate validation failed: {other}"),
        Err(e) => Err(e.into()),
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use veriface_core::decision::{decide, DecisionInput};
use veriface_core::quantize::{self, QuantBits};
use veriface_core::roc::{self, LabeledScore, RocPoint, RocReport};
use veriface_core::transport;
use veriface_core::{merge_overrides, DecisionPackage, FilePersistence, Policy, PolicyStore};

#[zbus::proxy(
    interface = "org.veriface.Decision1",
    default_service = "org.veriface.Decision1",
    default_path = "/org/veriface/Decision1"
)]
trait Veriface {
    async fn match_and_decide(&self, request_json: &str) -> zbus::Result<String>;
    async fn batch_match_and_decide(&self, requests_json: &str) -> zbus::Result<String>;
    async fn reload_policy(&self) -> zbus::Result<u64>;
    async fn reload_candidates(&self) -> zbus::Result<u32>;
    async fn effective_policy(&self, role: &str, identity: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "veriface", about = "Veriface matching and policy decision CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReloadTarget {
    Policy,
    Candidates,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep thresholds over labeled scores and report ROC metrics
    Roc {
        /// JSON array of {"score": f32, "genuine": bool}
        #[arg(short, long)]
        dataset: PathBuf,
        #[arg(long, default_value_t = 0.0)]
        start: f32,
        #[arg(long, default_value_t = 1.0)]
        end: f32,
        #[arg(long, default_value_t = 101)]
        steps: usize,
        /// Pick the match threshold meeting this false-accept rate
        #[arg(long)]
        target_fpr: Option<f32>,
        /// Pick the uncertain threshold meeting this genuine-accept rate
        #[arg(long)]
        target_tpr: Option<f32>,
        /// Write the chosen thresholds into this persisted policy store
        #[arg(long)]
        apply: Option<PathBuf>,
    },
    /// Run the decision engine on supplied scores
    Decide {
        /// Policy file (TOML)
        #[arg(short, long)]
        policy: PathBuf,
        #[arg(long)]
        match_score: f32,
        #[arg(long)]
        liveness: Option<f32>,
        #[arg(long)]
        secondary: Option<f32>,
        /// Candidates at or above the match threshold
        #[arg(long, default_value_t = 1)]
        candidates: usize,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        identity: Option<String>,
    },
    /// Print the effective policy for a role and identity
    Policy {
        /// Policy file (TOML)
        #[arg(short, long)]
        policy: PathBuf,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        identity: Option<String>,
    },
    /// Report quantization error for an embedding
    Quantize {
        /// JSON array of floats
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long, default_value_t = 8)]
        bits: u8,
    },
    /// Show daemon status
    Status,
    /// Send a match request (or a JSON array of them) to the daemon
    Match {
        #[arg(short, long)]
        request: PathBuf,
        /// Print transport tokens instead of the JSON package
        #[arg(long)]
        tokens: bool,
    },
    /// Ask the daemon to re-read its policy or gallery
    Reload {
        #[arg(value_enum)]
        target: ReloadTarget,
    },
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn load_policy(path: &Path) -> Result<Policy> {
    let policy = Policy::from_toml_str(&read(path)?)?;
    policy.rules.validate()?;
    Ok(policy)
}

fn print_point(label: &str, p: &RocPoint) {
    println!(
        "{label:<16} t={:.4}  tpr={:.4}  fpr={:.4}  acc={:.4}  f1={:.4}  bal={:.4}",
        p.threshold, p.tpr, p.fpr, p.accuracy, p.f1, p.balanced_accuracy
    );
}

/// Match threshold from the FPR target (best F1 otherwise); uncertain
/// threshold from the TPR target (current value otherwise), never above
/// the match threshold.
fn operating_point(
    report: &RocReport,
    target_fpr: Option<f32>,
    target_tpr: Option<f32>,
    current_uncertain: f32,
) -> Result<(f32, f32)> {
    let match_t = match target_fpr {
        Some(t) => match report.find_threshold_for_target_fpr(t) {
            Some(p) => p.threshold,
            None => bail!("no threshold reaches FPR <= {t}"),
        },
        None => report.best_f1.threshold,
    };
    let uncertain_t = match target_tpr {
        Some(t) => match report.find_threshold_for_target_tpr(t) {
            Some(p) => p.threshold,
            None => bail!("no threshold reaches TPR >= {t}"),
        },
        None => current_uncertain,
    };
    Ok((match_t, uncertain_t.min(match_t)))
}

/// Write the chosen operating point into a persisted policy store,
/// seeding it with the default policy when the file does not exist yet.
fn apply_to_store(
    path: &Path,
    report: &RocReport,
    target_fpr: Option<f32>,
    target_tpr: Option<f32>,
) -> Result<(f32, f32, std::sync::Arc<Policy>)> {
    let store = PolicyStore::new(FilePersistence::new(path), Duration::ZERO);
    let current = store.initialize()?;
    let (m, u) =
        operating_point(report, target_fpr, target_tpr, current.rules.uncertain_threshold)?;
    let updated = store.apply_operating_point(m, u)?;
    tracing::info!(
        path = %path.display(),
        global_match_threshold = m,
        uncertain_threshold = u,
        version = updated.version,
        "operating point written back"
    );
    Ok((m, u, updated))
}

async fn proxy(system: bool) -> Result<VerifaceProxy<'static>> {
    let builder = if system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder.method_timeout(Duration::from_secs(10)).build().await?;
    tracing::debug!(system, "connected to message bus");
    VerifaceProxy::new(&conn).await.context("connecting to verifaced")
}

fn print_packages(json: &str, tokens: bool) -> Result<()> {
    let packages: Vec<DecisionPackage> = match serde_json::from_str::<Vec<DecisionPackage>>(json) {
        Ok(list) => list,
        Err(_) => vec![serde_json::from_str(json)?],
    };
    for package in &packages {
        if tokens {
            println!("{}", transport::canonical_string(&transport::to_transport_record(package)?));
        } else {
            println!("{}", serde_json::to_string_pretty(package)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Roc {
            dataset,
            start,
            end,
            steps,
            target_fpr,
            target_tpr,
            apply,
        } => {
            let samples: Vec<LabeledScore> = serde_json::from_str(&read(&dataset)?)?;
            tracing::debug!(samples = samples.len(), steps, "sweeping thresholds");
            let report = roc::generate_report(&samples, &roc::threshold_grid(start, end, steps))?;

            println!(
                "samples: {} genuine, {} impostor   AUC {:.4}",
                report.genuine_count, report.impostor_count, report.auc
            );
            print_point("best F1", &report.best_f1);
            print_point("best accuracy", &report.best_accuracy);
            print_point("best balanced", &report.best_balanced_accuracy);
            if let Some(t) = target_fpr {
                match report.find_threshold_for_target_fpr(t) {
                    Some(p) => print_point(&format!("FPR <= {t}"), p),
                    None => println!("FPR <= {t}: unreachable"),
                }
            }
            if let Some(t) = target_tpr {
                match report.find_threshold_for_target_tpr(t) {
                    Some(p) => print_point(&format!("TPR >= {t}"), p),
                    None => println!("TPR >= {t}: unreachable"),
                }
            }

            if let Some(path) = apply {
                let (m, u, updated) = apply_to_store(&path, &report, target_fpr, target_tpr)?;
                println!(
                    "applied to {}: global_match_threshold={m:.4} \
                     uncertain_threshold={u:.4} (policy v{})",
                    path.display(),
                    updated.version
                );
            }
        }
        Commands::Decide {
            policy,
            match_score,
            liveness,
            secondary,
            candidates,
            role,
            identity,
        } => {
            let policy = load_policy(&policy)?;
            let effective = merge_overrides(&policy, role.as_deref(), identity.as_deref());
            let decision = decide(
                &DecisionInput {
                    match_score: Some(match_score),
                    liveness_score: liveness,
                    secondary_score: secondary,
                    candidate_count: candidates,
                },
                &effective.rules,
            );
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Policy { policy, role, identity } => {
            let policy = load_policy(&policy)?;
            let effective = merge_overrides(&policy, role.as_deref(), identity.as_deref());
            println!("{}", serde_json::to_string_pretty(&effective)?);
        }
        Commands::Quantize { input, bits } => {
            let values: Vec<f32> = serde_json::from_str(&read(&input)?)?;
            let bits = QuantBits::try_from(bits)?;
            let q = quantize::quantize(&values, bits)?;
            println!("dimension: {}", q.params.dimension);
            println!("bits:      {}", bits.as_u8());
            println!("scale:     {}", q.params.scale);
            println!("zero:      {}", q.params.zero_point);
            println!("bytes:     {}", q.buffer.to_le_bytes().len());
            println!("checksum:  {:08x}", q.checksum());
            println!("rmse:      {:.6}", quantize::estimate_error(&values, bits)?);
            println!("accuracy:  {:.3}%", quantize::accuracy_percent(&values, bits)?);
        }
        Commands::Status => {
            let proxy = proxy(cli.system).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Match { request, tokens } => {
            let body = read(&request)?;
            let proxy = proxy(cli.system).await?;
            let is_batch = body.trim_start().starts_with('[');
            let reply = if is_batch {
                proxy.batch_match_and_decide(&body).await?
            } else {
                proxy.match_and_decide(&body).await?
            };
            print_packages(&reply, tokens)?;
        }
        Commands::Reload { target } => {
            let proxy = proxy(cli.system).await?;
            match target {
                ReloadTarget::Policy => println!("policy version {}", proxy.reload_policy().await?),
                ReloadTarget::Candidates => {
                    println!("{} candidates loaded", proxy.reload_candidates().await?)
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RocReport {
        let samples = vec![
            LabeledScore { score: 0.9, genuine: true },
            LabeledScore { score: 0.6, genuine: true },
            LabeledScore { score: 0.4, genuine: true },
            LabeledScore { score: 0.7, genuine: false },
            LabeledScore { score: 0.3, genuine: false },
            LabeledScore { score: 0.1, genuine: false },
        ];
        roc::generate_report(&samples, &roc::threshold_grid(0.0, 1.0, 11)).unwrap()
    }

    #[test]
    fn test_operating_point_from_targets() {
        let (m, u) = operating_point(&report(), Some(0.0), Some(1.0), 0.4).unwrap();
        assert!((m - 0.8).abs() < 1e-6);
        assert!((u - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_operating_point_clamps_uncertain() {
        let r = report();
        let (m, u) = operating_point(&r, None, None, 0.95).unwrap();
        assert_eq!(m, r.best_f1.threshold);
        assert_eq!(u, m);
    }

    #[test]
    fn test_operating_point_unreachable_target() {
        assert!(operating_point(&report(), None, Some(1.5), 0.4).is_err());
    }

    #[test]
    fn test_apply_to_store_writes_back() {
        let path = std::env::temp_dir().join(format!("veriface-apply-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let (m, u, updated) = apply_to_store(&path, &report(), Some(0.0), Some(1.0)).unwrap();
        assert!((m - 0.8).abs() < 1e-6);
        assert!((u - 0.4).abs() < 1e-6);
        assert_eq!(updated.version, 1);

        let reread = PolicyStore::new(FilePersistence::new(&path), Duration::ZERO);
        let persisted = reread.initialize().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(persisted.version, 1);
        assert!((persisted.rules.global_match_threshold - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_cli_parses_decide() {
        let cli = Cli::try_parse_from([
            "veriface",
            "decide",
            "--policy",
            "p.toml",
            "--match-score",
            "0.8",
            "--liveness",
            "0.9",
            "--candidates",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Decide {
                match_score,
                liveness,
                candidates,
                secondary,
                ..
            } => {
                assert_eq!(match_score, 0.8);
                assert_eq!(liveness, Some(0.9));
                assert_eq!(secondary, None);
                assert_eq!(candidates, 2);
            }
            _ => panic!("expected decide"),
        }
    }
}

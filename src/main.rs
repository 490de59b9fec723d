use anyhow::{Context, Result};
use apkforge::apk::ApkMeta;
use apkforge::core::abi;
use apkforge::core::config::Settings;
use apkforge::core::logging;
use apkforge::pipeline::{self, BuildRequest, Pipeline};
use apkforge::sign;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML settings file. Defaults apply when absent.
    #[clap(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory relative keystore paths are resolved against.
    #[clap(long, global = true, default_value = ".")]
    data_dir: PathBuf,

    /// Print results as JSON.
    #[clap(long, global = true)]
    json: bool,

    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BuildArgs {
    /// Template APK
    #[clap(long)]
    template: PathBuf,

    /// File whose content becomes the embedded configuration asset
    #[clap(long)]
    config: PathBuf,

    #[clap(short, long)]
    output: PathBuf,

    #[clap(long, default_value = pipeline::DEFAULT_APP_NAME)]
    app_name: String,

    #[clap(long = "package", default_value = pipeline::DEFAULT_PACKAGE_NAME)]
    package_name: String,

    #[clap(long, default_value = pipeline::DEFAULT_VERSION_CODE)]
    version_code: String,

    #[clap(long, default_value = pipeline::DEFAULT_VERSION_NAME)]
    version_name: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Patch, repackage and sign a template
    Build {
        #[clap(flatten)]
        args: BuildArgs,
    },
    /// Check the signatures of an APK
    Verify { apk: PathBuf },
    /// Show package identity and ABIs of an APK
    Meta { apk: PathBuf },
    /// Show the ABIs this machine runs
    Abi,
    /// Show the signing certificate, creating the keystore if needed
    Identity,
}

#[derive(Debug, Serialize)]
struct IdentityInfo {
    keystore: PathBuf,
    fingerprint: String,
    certificate: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    cli.command.run(settings, &cli)
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{:#?}", value);
    }
    Ok(())
}

impl Commands {
    fn run(&self, settings: Settings, cli: &Cli) -> Result<()> {
        match self {
            Self::Build { args } => {
                let config_content = std::fs::read_to_string(&args.config)
                    .with_context(|| format!("While reading {}", args.config.display()))?;
                let request = BuildRequest {
                    template: args.template.clone(),
                    config_content,
                    output: args.output.clone(),
                    app_name: args.app_name.clone(),
                    package_name: args.package_name.clone(),
                    version_code: args.version_code.clone(),
                    version_name: args.version_name.clone(),
                };
                let pipeline = Pipeline::new(settings, &cli.data_dir)?;
                let output = pipeline.build_and_sign(&request)?;
                println!("{}", output.display());
            }
            Self::Verify { apk } => {
                let report = sign::verify(apk)?;
                if cli.json {
                    print(true, &report)?;
                } else {
                    report.log();
                    for signer in &report.signers {
                        println!("signer {}", signer);
                    }
                }
                anyhow::ensure!(report.verified, "{} does not verify", apk.display());
            }
            Self::Meta { apk } => print(cli.json, &ApkMeta::read(apk)?)?,
            Self::Abi => print(cli.json, &abi::abi_info())?,
            Self::Identity => {
                let pipeline = Pipeline::new(settings, &cli.data_dir)?;
                let signer = pipeline.identity().acquire()?;
                let info = IdentityInfo {
                    keystore: pipeline.identity().path().to_path_buf(),
                    fingerprint: signer.fingerprint(),
                    certificate: signer.cert_pem(),
                };
                if cli.json {
                    print(true, &info)?;
                } else {
                    println!("keystore    {}", info.keystore.display());
                    println!("fingerprint {}", info.fingerprint);
                    print!("{}", info.certificate);
                }
            }
        }
        Ok(())
    }
}

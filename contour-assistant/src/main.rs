// contour-model-download: fetch GGUF models into the assistant's models folder

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser};

use contour_assistant::downloader::{artifact_name, build_url, file_name_from_url, DEFAULT_REVISION};
use contour_assistant::model_store::{default_models_dir, expand_home};
use contour_assistant::{DownloadError, DownloadProgress, Downloader, ModelStore};

#[derive(Parser, Debug)]
#[command(
    name = "contour-model-download",
    about = "Download a GGUF model for the Contour assistant",
    after_help = "Examples:\n  \
        contour-model-download --hf-repo TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF \\\n      \
        --hf-file tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf\n  \
        contour-model-download --url https://example.com/model.gguf --output my-model\n  \
        contour-model-download --list"
)]
struct Args {
    /// Direct download URL of a .gguf file
    #[arg(long)]
    url: Option<String>,

    /// Hugging Face repository, e.g. TheBloke/phi-2-GGUF
    #[arg(long)]
    hf_repo: Option<String>,

    /// File name inside the Hugging Face repository
    #[arg(long)]
    hf_file: Option<String>,

    #[arg(long, default_value = DEFAULT_REVISION)]
    hf_revision: String,

    /// Save as this name (.gguf is appended when missing)
    #[arg(long, short)]
    output: Option<String>,

    /// Replace an existing file
    #[arg(long)]
    force: bool,

    /// List models in the models directory and exit
    #[arg(long)]
    list: bool,

    /// Models directory (default: the assistant's models folder)
    #[arg(long)]
    models_dir: Option<String>,
}

impl Args {
    fn store(&self) -> ModelStore {
        let dir = self
            .models_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(default_models_dir);
        ModelStore::new(dir)
    }
}

/// Command-line mistakes, reported before anything is downloaded
#[derive(Debug, thiserror::Error)]
enum UsageError {
    #[error("provide --url or both --hf-repo and --hf-file.")]
    MissingSource,

    #[error(transparent)]
    Name(#[from] DownloadError),
}

/// Source URL and destination file of a download
#[derive(Debug, PartialEq, Eq)]
struct Plan {
    url: String,
    dest: PathBuf,
}

/// `--output`, else the URL's last segment, else `--hf-file`; `.gguf` is
/// appended when missing.
fn resolve_destination(args: &Args, store: &ModelStore) -> Result<Plan, UsageError> {
    let (url, default_name) = match (&args.url, &args.hf_repo, &args.hf_file) {
        (Some(url), _, _) => (url.clone(), file_name_from_url(url)),
        (None, Some(repo), Some(file)) => {
            let name = file.rsplit('/').next().unwrap_or(file).to_string();
            (build_url(repo, file, &args.hf_revision), name)
        }
        _ => return Err(UsageError::MissingSource),
    };
    let name = artifact_name(args.output.as_deref().unwrap_or(&default_name))?;
    Ok(Plan {
        url,
        dest: store.artifact_path(&name),
    })
}

fn list_models(store: &ModelStore, out: &mut impl Write) -> io::Result<()> {
    let dir = store.resolve_directory();
    if !dir.is_dir() {
        return writeln!(out, "Models directory does not exist: {}", dir.display());
    }
    let artifacts = store.list_artifacts();
    if artifacts.is_empty() {
        return writeln!(out, "No .gguf files in {}", dir.display());
    }
    writeln!(out, "Models in {}:", dir.display())?;
    for artifact in artifacts {
        writeln!(out, "  {}  ({:.1} MiB)", artifact.file_name, artifact.size_mib())?;
    }
    Ok(())
}

/// Process exit status for a failed run
const FAILURE: u8 = 1;

async fn run<O, E>(args: &Args, out: &mut O, err: &mut E) -> io::Result<u8>
where
    O: Write + Send,
    E: Write,
{
    let store = args.store();
    if args.list {
        list_models(&store, out)?;
        return Ok(0);
    }

    let plan = match resolve_destination(args, &store) {
        Ok(plan) => plan,
        Err(UsageError::MissingSource) => {
            writeln!(out, "{}", Args::command().render_help())?;
            writeln!(err, "Error: {}", UsageError::MissingSource)?;
            return Ok(FAILURE);
        }
        Err(e) => {
            writeln!(err, "Error: {}", e)?;
            return Ok(FAILURE);
        }
    };

    match download(&plan.url, &plan.dest, args.force, out).await {
        Ok(()) => {
            writeln!(out, "Set 'model path' in Contour to:\n  {}", plan.dest.display())?;
            Ok(0)
        }
        Err(e) => {
            if !e.is_certificate() {
                writeln!(err, "Error: {}", e)?;
            }
            if let Some(hint) = e.remediation() {
                writeln!(err, "{}", hint)?;
            }
            Ok(FAILURE)
        }
    }
}

async fn download<O: Write + Send>(url: &str, dest: &Path, force: bool, out: &mut O) -> Result<(), DownloadError> {
    let io_err = |source| DownloadError::Io {
        path: dest.to_path_buf(),
        source,
    };
    if dest.is_file() && !force {
        writeln!(out, "Already exists (use --force to replace): {}", dest.display()).map_err(io_err)?;
        return Ok(());
    }

    writeln!(out, "Downloading {}", url).map_err(io_err)?;
    writeln!(out, "  -> {}", dest.display()).map_err(io_err)?;

    let downloader = Downloader::new()?;
    let mut reported = false;
    downloader
        .fetch(url, dest, force, |progress: DownloadProgress| {
            reported = true;
            let _ = write!(
                out,
                "\r  {:.1}% ({:.1} / {:.1} MiB)",
                progress.percent, progress.downloaded_mib, progress.total_mib
            );
            let _ = out.flush();
        })
        .await?;
    if reported {
        writeln!(out).map_err(io_err)?;
    }
    writeln!(out, "Done.").map_err(io_err)?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args, &mut io::stdout(), &mut io::stderr()).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("Failed to write output: {}", e);
            ExitCode::from(FAILURE)
        }
    }
}

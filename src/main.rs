//! relic - encrypted secrets artifacts
//!
//! Commands:
//! - init: Generate a master key and an empty artifact
//! - edit: Decrypt, edit in $EDITOR, validate and re-encrypt
//! - show: Print the decrypted artifact
//! - get <path>: Print one value by dotted path
//! - encrypt [input]: Encrypt plaintext JSON into artifact text
//! - decrypt [input]: Decrypt artifact text into plaintext JSON

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relic::config::{parse_iterations, resolve_master_key};
use relic::{
    artifact, Config, EditOutcome, Engine, KeyCache, MasterKey, Node, RelicError, SecretsTree,
};

#[derive(Parser)]
#[command(name = "relic")]
#[command(about = "Per-value encrypted secrets artifacts that are safe to commit")]
#[command(version)]
#[command(after_help = "\
EXAMPLES:
    relic init                       Create config/relic.key and config/relic.json
    relic edit                       Edit secrets in $VISUAL / $EDITOR
    relic get database.password      Print a single value
    relic encrypt plain.json -o config/relic.json
    relic decrypt | jq .")]
struct Cli {
    /// Encrypted artifact path (overrides RELIC_ARTIFACT)
    #[arg(long, global = true)]
    artifact: Option<PathBuf>,

    /// Master key file path (overrides RELIC_MASTER_KEY_FILE)
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// PBKDF2 iterations for newly encrypted values (overrides RELIC_ITERATIONS)
    #[arg(long, global = true, value_parser = parse_iterations)]
    iterations: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a master key and an empty artifact
    Init {
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Edit the decrypted secrets and re-encrypt on save
    Edit,

    /// Print the decrypted secrets as JSON
    Show,

    /// Print one value by dotted path
    Get {
        /// Dotted key path, e.g. database.password
        path: String,
    },

    /// Encrypt plaintext JSON into artifact text
    Encrypt {
        /// Plaintext JSON file (stdin if omitted or "-")
        input: Option<PathBuf>,

        /// Write the artifact here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decrypt artifact text into plaintext JSON
    Decrypt {
        /// Artifact file ("-" for stdin, the configured artifact if omitted)
        input: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relic=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.artifact {
        config.artifact_path = path;
    }
    if let Some(path) = cli.key_file {
        config.key_file = path;
    }
    if let Some(iterations) = cli.iterations {
        config.iterations = iterations;
    }

    let engine = Engine::new(Arc::new(KeyCache::new())).with_iterations(config.iterations)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&config, force, Path::new(".gitignore")).await,
        Commands::Edit => cmd_edit(&config, &engine).await,
        Commands::Show => cmd_show(&config, &engine).await,
        Commands::Get { path } => cmd_get(&config, &engine, &path).await,
        Commands::Encrypt { input, output } => {
            cmd_encrypt(&config, &engine, input.as_deref(), output.as_deref()).await
        }
        Commands::Decrypt { input } => cmd_decrypt(&config, &engine, input.as_deref()).await,
    }
}

async fn cmd_init(config: &Config, force: bool, gitignore: &Path) -> Result<()> {
    if config.key_file.exists() && !force {
        bail!(
            "Key file {} already exists (use --force to replace it)",
            config.key_file.display()
        );
    }
    // A new key cannot decrypt tokens made under the old one.
    if artifact_has_secrets(&config.artifact_path).await? {
        bail!(
            "Artifact {} already holds secrets that a new key could not decrypt; \
             move it aside before running init",
            config.artifact_path.display()
        );
    }

    let key = MasterKey::generate();
    write_key_file(&config.key_file, key.expose())
        .await
        .with_context(|| format!("Failed to write {}", config.key_file.display()))?;
    info!("Wrote master key to {}", config.key_file.display());

    if ensure_gitignored(gitignore, &config.key_file)
        .await
        .context("Failed to update .gitignore")?
    {
        info!("Added {} to .gitignore", config.key_file.display());
    }

    if config.artifact_path.exists() {
        warn!(
            "Artifact {} already exists and was left as is",
            config.artifact_path.display()
        );
    } else {
        artifact::store(&config.artifact_path, &artifact::serialize(&SecretsTree::new())).await?;
        info!("Created empty artifact {}", config.artifact_path.display());
    }

    Ok(())
}

/// Whether the artifact exists with any content beyond an empty object.
async fn artifact_has_secrets(path: &Path) -> Result<bool> {
    let text = match artifact::load(path).await {
        Ok(text) => text,
        Err(RelicError::MissingArtifact(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(match artifact::parse(&text) {
        Ok(tree) => tree.leaf_count() > 0,
        Err(_) => !text.trim().is_empty(),
    })
}

async fn cmd_edit(config: &Config, engine: &Engine) -> Result<()> {
    let key = resolve_master_key(config).await?;
    let mut transaction = engine.edit(key, &config.artifact_path);

    match transaction.run(&config.editor()).await? {
        EditOutcome::Committed { .. } | EditOutcome::Unchanged => Ok(()),
        EditOutcome::Aborted(reason) => {
            bail!("Edit aborted, artifact unchanged: {}", reason)
        }
    }
}

async fn cmd_show(config: &Config, engine: &Engine) -> Result<()> {
    let key = resolve_master_key(config).await?;
    let secrets = engine.load_secrets(&key, &config.artifact_path).await?;
    print!("{}", artifact::serialize(&secrets));
    Ok(())
}

async fn cmd_get(config: &Config, engine: &Engine, path: &str) -> Result<()> {
    let key = resolve_master_key(config).await?;
    let secrets = engine.load_secrets(&key, &config.artifact_path).await?;

    match secrets.get(path) {
        Some(Node::Leaf(serde_json::Value::String(s))) => println!("{}", s),
        Some(Node::Leaf(value)) => println!("{}", value),
        Some(Node::Branch(tree)) => print!("{}", artifact::serialize(tree)),
        None => bail!("No value at '{}'", path),
    }
    Ok(())
}

async fn cmd_encrypt(
    config: &Config,
    engine: &Engine,
    input: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let key = resolve_master_key(config).await?;
    let plain = read_input(input).await?;

    let cipher_text = {
        let engine = engine.clone();
        relic::engine::blocking(move || engine.encrypt_artifact(&key, &plain, None)).await?
    };

    match output {
        Some(path) => {
            artifact::store(path, &cipher_text).await?;
            info!("Wrote artifact to {}", path.display());
        }
        None => print!("{}", cipher_text),
    }
    Ok(())
}

async fn cmd_decrypt(config: &Config, engine: &Engine, input: Option<&Path>) -> Result<()> {
    let key = resolve_master_key(config).await?;
    let text = match input {
        Some(path) => read_input(Some(path)).await?,
        None => artifact::load(&config.artifact_path).await?,
    };

    let plain = {
        let engine = engine.clone();
        relic::engine::blocking(move || engine.decrypt_artifact(&key, &text)).await?
    };
    print!("{}", plain);
    Ok(())
}

/// Read a file, or stdin when `path` is absent or `-`.
async fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

async fn write_key_file(path: &Path, key: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    // `mode` only applies on creation; tighten a pre-existing file as well.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(key.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.sync_all().await
}

/// Append `entry` to the ignore file unless it is already listed. Returns
/// whether the file changed.
async fn ensure_gitignored(gitignore: &Path, entry: &Path) -> std::io::Result<bool> {
    let entry = entry.to_string_lossy().replace('\\', "/");
    let entry = entry.trim_start_matches("./");

    let existing = match tokio::fs::read_to_string(gitignore).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let listed = existing.lines().map(str::trim).any(|line| {
        line == entry || line.strip_prefix('/') == Some(entry)
    });
    if listed {
        return Ok(false);
    }

    let mut addition = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        addition.push('\n');
    }
    addition.push_str(entry);
    addition.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(gitignore)
        .await?;
    file.write_all(addition.as_bytes()).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "relic",
            "get",
            "db.password",
            "--artifact",
            "a.json",
            "--iterations",
            "1000",
        ])
        .unwrap();
        assert_eq!(cli.artifact, Some(PathBuf::from("a.json")));
        assert_eq!(cli.iterations, Some(1000));
        assert!(matches!(cli.command, Commands::Get { ref path } if path == "db.password"));
    }

    #[test]
    fn test_cli_rejects_zero_iterations() {
        assert!(Cli::try_parse_from(["relic", "--iterations", "0", "show"]).is_err());
    }

    #[tokio::test]
    async fn test_gitignore_is_created_and_appended_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gitignore = dir.path().join(".gitignore");
        std::fs::write(&gitignore, "target").unwrap();

        assert!(ensure_gitignored(&gitignore, Path::new("config/relic.key"))
            .await
            .unwrap());
        assert!(!ensure_gitignored(&gitignore, Path::new("./config/relic.key"))
            .await
            .unwrap());
        assert_eq!(
            std::fs::read_to_string(&gitignore).unwrap(),
            "target\nconfig/relic.key\n"
        );
    }

    #[tokio::test]
    async fn test_gitignore_recognises_anchored_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gitignore = dir.path().join(".gitignore");
        std::fs::write(&gitignore, "/config/relic.key\n").unwrap();

        assert!(!ensure_gitignored(&gitignore, Path::new("config/relic.key"))
            .await
            .unwrap());
    }

    struct InitFixture {
        dir: tempfile::TempDir,
        config: Config,
    }

    impl InitFixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let config = Config {
                artifact_path: dir.path().join("config").join("relic.json"),
                key_file: dir.path().join("config").join("relic.key"),
                ..Config::default()
            };
            Self { dir, config }
        }

        async fn init(&self, force: bool) -> Result<()> {
            cmd_init(&self.config, force, &self.dir.path().join(".gitignore")).await
        }

        fn key(&self) -> String {
            std::fs::read_to_string(&self.config.key_file).unwrap()
        }
    }

    #[tokio::test]
    async fn test_init_creates_key_artifact_and_gitignore() {
        let fx = InitFixture::new();
        fx.init(false).await.unwrap();

        assert_eq!(fx.key().trim().len(), 64);
        assert_eq!(
            std::fs::read_to_string(&fx.config.artifact_path).unwrap(),
            "{}\n"
        );
        let ignored = std::fs::read_to_string(fx.dir.path().join(".gitignore")).unwrap();
        assert!(ignored.contains("relic.key"));
    }

    #[tokio::test]
    async fn test_init_refuses_existing_key_without_force() {
        let fx = InitFixture::new();
        fx.init(false).await.unwrap();
        let key = fx.key();

        assert!(fx.init(false).await.is_err());
        assert_eq!(fx.key(), key);
    }

    #[tokio::test]
    async fn test_forced_init_keeps_key_when_artifact_holds_secrets() {
        let fx = InitFixture::new();
        fx.init(false).await.unwrap();
        let key = fx.key();

        let engine = Engine::default().with_iterations(1_000).unwrap();
        let master = MasterKey::new(key.trim()).unwrap();
        let text = engine
            .encrypt_artifact(&master, r#"{"API_KEY": "abc"}"#, None)
            .unwrap();
        artifact::store(&fx.config.artifact_path, &text).await.unwrap();

        let err = fx.init(true).await.unwrap_err();
        assert!(err.to_string().contains("already holds secrets"), "{}", err);
        assert_eq!(fx.key(), key);
        assert_eq!(
            std::fs::read_to_string(&fx.config.artifact_path).unwrap(),
            text
        );
    }

    #[tokio::test]
    async fn test_forced_init_replaces_key_for_empty_artifact() {
        let fx = InitFixture::new();
        fx.init(false).await.unwrap();
        let key = fx.key();

        fx.init(true).await.unwrap();
        assert_ne!(fx.key(), key);
    }

    #[tokio::test]
    async fn test_init_refuses_unreadable_artifact_content() {
        let fx = InitFixture::new();
        artifact::store(&fx.config.artifact_path, "not json")
            .await
            .unwrap();

        assert!(fx.init(false).await.is_err());
        assert!(!fx.config.key_file.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys").join("relic.key");
        write_key_file(&path, "abc").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc\n");
    }
}

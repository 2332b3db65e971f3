// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::logging,
    clap::{value_t, App, AppSettings, Arg, ArgMatches, SubCommand},
    hackage_repository::{
        crypto::KeyId, Client, HackageRepositoryError, LocalRepository, PackageId,
        RemoteRepository,
    },
    std::{path::Path, str::FromStr},
    thiserror::Error,
    url::Url,
};

const REPOSITORY_ABOUT: &str = "\
Repository locations

The --repository argument accepts a URL or a local filesystem path.

If the value contains `://`, it is parsed as a URL. `http://` and
`https://` URLs address a repository served by a mirror; `file://` URLs
and plain paths address a repository laid out on the local filesystem.

In all cases the location must point at the repository root: the
directory containing `root.json` and `00-index.tar`.
";

#[derive(Debug, Error)]
pub enum HrtError {
    #[error("argument parsing error: {0}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Repository(#[from] HackageRepositoryError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, HrtError>;

/// Process exit code for an error.
///
/// 1 means the repository failed verification, 2 means it could not be
/// reached, 3 means the invocation itself was wrong.
pub fn exit_code(error: &HrtError) -> i32 {
    match error {
        HrtError::Clap(_) | HrtError::InvalidSubCommand(_) | HrtError::InvalidArgument(_) => 3,
        HrtError::Io(_) => 2,
        HrtError::Repository(e) => match e {
            HackageRepositoryError::Http(_)
            | HackageRepositoryError::HttpStatus { .. }
            | HackageRepositoryError::NotFound(_)
            | HackageRepositoryError::Io(_)
            | HackageRepositoryError::IoPath(..) => 2,
            HackageRepositoryError::UrlParse(_) => 3,
            _ => 1,
        },
    }
}

pub fn run_cli() -> Result<()> {
    let app = App::new("Hackage Repository Tool")
        .setting(AppSettings::ArgRequiredElseHelp)
        .version("0.1")
        .about("Securely interact with Hackage package repositories")
        .long_about(REPOSITORY_ABOUT);

    let app = app
        .arg(
            Arg::with_name("repository")
                .long("--repository")
                .takes_value(true)
                .global(true)
                .help("URL or filesystem path of the repository root"),
        )
        .arg(
            Arg::with_name("cache-dir")
                .long("--cache-dir")
                .takes_value(true)
                .global(true)
                .help("Directory holding verified repository state"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("-v")
                .long("--verbose")
                .global(true)
                .help("Enable verbose logging"),
        );

    let app = app.subcommand(
        SubCommand::with_name("bootstrap")
            .about("Establish the trust root from out-of-band key fingerprints")
            .arg(
                Arg::with_name("threshold")
                    .long("--threshold")
                    .takes_value(true)
                    .required(true)
                    .help("How many of the supplied keys must have signed the root"),
            )
            .arg(
                Arg::with_name("root-key")
                    .long("--root-key")
                    .takes_value(true)
                    .multiple(true)
                    .number_of_values(1)
                    .required(true)
                    .help("Expected root key fingerprint (repeatable)"),
            ),
    );

    let app = app.subcommand(
        SubCommand::with_name("check")
            .about("Fetch and verify the latest repository metadata")
            .arg(
                Arg::with_name("no-expiry-check")
                    .long("--no-expiry-check")
                    .help("Skip expiry checks (offline inspection of stale repositories)"),
            ),
    );

    let app = app.subcommand(
        SubCommand::with_name("get")
            .about("Download a verified package tarball")
            .arg(
                Arg::with_name("package")
                    .required(true)
                    .help("Package identifier, e.g. lens-5.2.1"),
            )
            .arg(
                Arg::with_name("output")
                    .long("--output")
                    .takes_value(true)
                    .help("Destination path (defaults to <package>.tar.gz)"),
            ),
    );

    let matches = match app.get_matches_safe() {
        Ok(matches) => matches,
        Err(e)
            if matches!(
                e.kind,
                clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed
            ) =>
        {
            e.exit()
        }
        Err(e) => return Err(e.into()),
    };

    logging::init(matches.is_present("verbose"));

    match matches.subcommand() {
        ("bootstrap", Some(args)) => command_bootstrap(args),
        ("check", Some(args)) => command_check(args),
        ("get", Some(args)) => command_get(args),
        (command, _) => Err(HrtError::InvalidSubCommand(command.to_string())),
    }
}

fn make_client(args: &ArgMatches<'_>) -> Result<Client> {
    let repository = args
        .value_of("repository")
        .ok_or_else(|| HrtError::InvalidArgument("--repository is required".to_string()))?;
    let cache_dir = args
        .value_of_os("cache-dir")
        .ok_or_else(|| HrtError::InvalidArgument("--cache-dir is required".to_string()))?;

    if repository.contains("://") {
        let url = Url::parse(repository)
            .map_err(|e| HrtError::InvalidArgument(format!("{}: {}", repository, e)))?;

        match url.scheme() {
            "http" | "https" => Ok(Client::new(Box::new(RemoteRepository::new(
                url, cache_dir,
            )?))),
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    HrtError::InvalidArgument(format!("{} is not a usable file URL", repository))
                })?;

                Ok(Client::new(Box::new(LocalRepository::new(
                    path, cache_dir,
                )?)))
            }
            scheme => Err(HrtError::InvalidArgument(format!(
                "unsupported URL scheme: {}",
                scheme
            ))),
        }
    } else {
        Ok(Client::new(Box::new(LocalRepository::new(
            repository, cache_dir,
        )?)))
    }
}

fn command_bootstrap(args: &ArgMatches<'_>) -> Result<()> {
    let threshold = value_t!(args.value_of("threshold"), u32)?;

    let fingerprints = args
        .values_of("root-key")
        .expect("root-key argument is required")
        .map(|value| {
            KeyId::from_str(value)
                .map_err(|e| HrtError::InvalidArgument(format!("--root-key {}: {}", value, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    make_client(args)?.bootstrap(&fingerprints, threshold)?;
    println!("OK");

    Ok(())
}

fn command_check(args: &ArgMatches<'_>) -> Result<()> {
    let check_expiry = !args.is_present("no-expiry-check");

    let outcome = make_client(args)?.check_for_updates(check_expiry)?;
    println!("{}", outcome);

    Ok(())
}

fn command_get(args: &ArgMatches<'_>) -> Result<()> {
    let package = args.value_of("package").expect("package is required");
    let package = PackageId::from_str(package)
        .map_err(|e| HrtError::InvalidArgument(format!("{}: {}", package, e)))?;

    let output = args
        .value_of("output")
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{}.tar.gz", package));

    make_client(args)?.download_package(&package, Path::new(&output))?;

    Ok(())
}

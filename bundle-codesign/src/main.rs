// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    bundle_codesign::{
        codesign_bundle, verify_signature, BundleCodesignError, CiBackend, CodesignConfig,
        DuctCommandRunner, IdentityLister, LogContext, RunnerOptions, SecurityIdentityLister,
    },
    clap::{Arg, ArgMatches, Command},
    log::{info, LevelFilter},
    std::{io::Write, path::PathBuf},
};

const SIGN_ABOUT: &str = "\
Sign an application bundle and everything nested in it.

Nested code is signed bottom-up in a fixed sequence of component categories
(NLP libraries, SASL plugins, database libraries, native components, helper
tools, the updater, plugins, frameworks, the bin directory, ...). The bundle
itself is signed last, its Info.plist is updated and it is signed again.

By default the first installed `Developer ID Application` identity is used.
Use --identity to select another by name, name prefix or SHA-1 hash. Run the
`list-identities` command to see what is installed.

Run options may be given in a YAML file via --options. Every key is optional:

    remove-temp-files: true
    pre-cleanup: true
    remove-scripting-runtime: true
    remove-component-plugins: false
    move-plugin-manifest: false
    categories: [plugins, frameworks]
    timestamp: true
    timestamp-url: http://timestamp.example.com
    lowercase-executable-name: true
    verify: true
    dry-run: false
    stream-output: false
    command-timeout-secs: 600

Command line flags take precedence over the options file.
";

fn parse_ci_backend(args: &ArgMatches) -> Result<CiBackend, BundleCodesignError> {
    match args.value_of("ci") {
        Some(value) => value.parse(),
        None => Ok(CiBackend::detect()),
    }
}

fn command_sign(args: &ArgMatches, ci: CiBackend) -> Result<(), BundleCodesignError> {
    let bundle_path = PathBuf::from(
        args.value_of("bundle")
            .ok_or_else(|| BundleCodesignError::InvalidOption("bundle path required".into()))?,
    );

    let mut config = CodesignConfig::new(&bundle_path);

    if let Some(path) = args.value_of("options") {
        config.set_options(RunnerOptions::from_yaml_path(&PathBuf::from(path))?);
    }

    if let Some(identity) = args.value_of("identity") {
        config.set_identity(identity);
    }
    if args.is_present("no_hardened_runtime") {
        config.set_hardened_runtime(false);
    }
    if let Some(path) = args.value_of("entitlements") {
        config.set_entitlements_file(&PathBuf::from(path))?;
    }
    if let Some(path) = args.value_of("info_plist_keys") {
        config.set_info_plist_overrides_file(&PathBuf::from(path))?;
    }

    let options = config.options_mut();
    if let Some(url) = args.value_of("timestamp_url") {
        options.timestamp = true;
        options.timestamp_url = Some(url.to_string());
    }
    if args.is_present("no_timestamp") {
        options.timestamp = false;
        options.timestamp_url = None;
    }
    if let Some(value) = args.value_of("timeout") {
        let seconds = value.parse::<u64>().map_err(|_| {
            BundleCodesignError::InvalidOption(format!("invalid timeout: {}", value))
        })?;
        options.command_timeout_secs = Some(seconds);
    }
    if args.is_present("dry_run") {
        options.dry_run = true;
    }
    if args.is_present("stream_output") {
        options.stream_output = true;
    }

    let runner = DuctCommandRunner;
    let lister = SecurityIdentityLister::new(&runner);
    let log = LogContext::new(ci);

    let report = codesign_bundle(&config, &lister, &runner, &log)?;

    info!(
        "signed {} paths; removed {}; bundle is {}",
        report.signed.len(),
        report.removed.len(),
        report.state
    );

    Ok(())
}

fn command_list_identities(args: &ArgMatches) -> Result<(), BundleCodesignError> {
    let runner = DuctCommandRunner;
    let mut lister = SecurityIdentityLister::new(&runner);

    if let Some(policy) = args.value_of("policy") {
        lister = lister.policy(policy);
    }

    let identities = lister.list_identities()?;

    if identities.is_empty() {
        eprintln!("no code signing identities found");
    }

    for (i, identity) in identities.iter().enumerate() {
        println!("{:>3}) {} \"{}\"", i + 1, identity.hash(), identity.name());
    }

    Ok(())
}

fn command_verify(args: &ArgMatches) -> Result<(), BundleCodesignError> {
    let path = PathBuf::from(
        args.value_of("path")
            .ok_or_else(|| BundleCodesignError::InvalidOption("path required".into()))?,
    );

    verify_signature(&DuctCommandRunner, &path)
}

fn main_impl() -> Result<(), BundleCodesignError> {
    let app = Command::new("bundle-codesign")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign nested macOS application bundles bottom-up with Apple's codesign")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("ci")
                .long("ci")
                .global(true)
                .takes_value(true)
                .possible_values(["plain", "azure", "github"])
                .help("CI system to emit log group markers for (detected from the environment by default)"),
        );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign an application bundle")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("bundle")
                    .required(true)
                    .help("Path of the .app bundle to sign"),
            )
            .arg(
                Arg::new("identity")
                    .long("identity")
                    .takes_value(true)
                    .help("Signing identity name, name prefix or SHA-1 hash"),
            )
            .arg(
                Arg::new("no_hardened_runtime")
                    .long("no-hardened-runtime")
                    .help("Do not enable the hardened runtime"),
            )
            .arg(
                Arg::new("entitlements")
                    .long("entitlements")
                    .takes_value(true)
                    .help("Plist file of entitlements to merge over the defaults"),
            )
            .arg(
                Arg::new("info_plist_keys")
                    .long("info-plist-keys")
                    .takes_value(true)
                    .help("Plist file of Info.plist keys to merge over the defaults"),
            )
            .arg(
                Arg::new("options")
                    .long("options")
                    .takes_value(true)
                    .help("YAML file of run options"),
            )
            .arg(
                Arg::new("timestamp_url")
                    .long("timestamp-url")
                    .takes_value(true)
                    .conflicts_with("no_timestamp")
                    .help("Timestamp server to use instead of Apple's"),
            )
            .arg(
                Arg::new("no_timestamp")
                    .long("no-timestamp")
                    .help("Do not request secure timestamps"),
            )
            .arg(
                Arg::new("timeout")
                    .long("timeout")
                    .takes_value(true)
                    .help("Kill any external command running longer than this many seconds"),
            )
            .arg(
                Arg::new("dry_run")
                    .long("dry-run")
                    .help("Log what would be done without changing anything"),
            )
            .arg(
                Arg::new("stream_output")
                    .long("stream-output")
                    .help("Log codesign output as it is produced"),
            ),
    );

    let app = app.subcommand(
        Command::new("list-identities")
            .about("Print installed code signing identities in the order they are searched")
            .arg(
                Arg::new("policy")
                    .long("policy")
                    .takes_value(true)
                    .help("Certificate policy to filter identities by (e.g. codesigning)"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Verify the signature of a bundle and everything nested in it")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path of the bundle or binary to verify"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let ci = match matches.subcommand() {
        Some((_, args)) => parse_ci_backend(args)?,
        None => parse_ci_backend(&matches)?,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder.format(move |buf, record| {
            writeln!(buf, "{}{}", ci.level_prefix(record.level()), record.args())
        });
    }

    builder.init();

    match matches.subcommand() {
        Some(("sign", args)) => command_sign(args, ci),
        Some(("list-identities", args)) => command_list_identities(args),
        Some(("verify", args)) => command_verify(args),
        _ => Err(BundleCodesignError::InvalidOption(
            "unknown command".to_string(),
        )),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}

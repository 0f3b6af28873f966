use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use proxmox_router::cli::*;
use proxmox_schema::api;

use grflow::analyze::{flows, Analysis, AnalysisOptions};
use grflow::inputs;
use grflow::policy::{parser::PolicyParser, preprocess};

#[api(
    input: {
        properties: {
            policy: {
                description: "Path to the root policy file or directory.",
            },
            admin: {
                description: "Do not blacklist administrative roles.",
                optional: true,
                default: false,
            },
            bestcase: {
                description: "Assume no set-UID/GID binaries: exec transitions keep the current identity.",
                optional: true,
                default: false,
            },
            entrypoints: {
                description: "File listing entry-point states and indirect-flow triples.",
                optional: true,
            },
            targets: {
                description: "File listing target paths, one per line.",
                optional: true,
            },
            learnconfig: {
                description: "Extract targets from a gradm learn-config file.",
                optional: true,
            },
            processedpolicy: {
                description: "Dump the preprocessed policy to this file.",
                optional: true,
            },
            output: {
                description: "Write the findings to this file instead of stdout.",
                optional: true,
            },
            debug: {
                description: "Enable verbose diagnostics.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Search a grsecurity RBAC policy for information flows reachable from the
/// configured entry points.
#[allow(clippy::too_many_arguments)]
fn analyze_policy(
    policy: String,
    admin: bool,
    bestcase: bool,
    entrypoints: Option<String>,
    targets: Option<String>,
    learnconfig: Option<String>,
    processedpolicy: Option<String>,
    output: Option<String>,
    debug: bool,
) -> Result<(), Error> {
    let options = AnalysisOptions {
        allow_admin_roles: admin,
        best_case_exec: bestcase,
    };
    if debug {
        log::debug!("analysis options: {:?}", options);
    }

    let text = preprocess::expand_policy(&PathBuf::from(&policy))?;
    if let Some(ref path) = processedpolicy {
        std::fs::write(path, &text)
            .map_err(|err| format_err!("unable to write processed policy '{}' - {}", path, err))?;
        log::info!("processed policy written to '{}'", path);
    }

    let decls = PolicyParser::new(&text).parse()?;
    let analysis = Analysis::build(decls, options)?;
    log::info!(
        "policy compiled: {} roles, {} subjects, {} states",
        analysis.roles.len(),
        analysis.subjects.len(),
        analysis.states.len()
    );

    let mut target_list = Vec::new();
    if let Some(ref path) = targets {
        target_list.extend(inputs::read_targets(Path::new(path))?);
    }
    if let Some(ref path) = learnconfig {
        target_list.extend(inputs::read_learn_config(Path::new(path))?);
    }

    let entry_points = match entrypoints {
        Some(ref path) => inputs::read_entry_points(Path::new(path))?,
        None => Default::default(),
    };
    if entry_points.states.is_empty() && entry_points.triples.is_empty() {
        log::warn!("no entry points configured, nothing to analyse");
        return Ok(());
    }
    if target_list.is_empty() && !entry_points.states.is_empty() {
        log::warn!("no targets configured, direct flow analysis will be empty");
    }

    let report = flows::analyze_all(
        &analysis,
        &entry_points.states,
        &entry_points.triples,
        &target_list,
    )?;

    match output {
        Some(ref path) => {
            let file = File::create(path)
                .map_err(|err| format_err!("unable to create output file '{}' - {}", path, err))?;
            let mut writer = BufWriter::new(file);
            flows::render_report(&analysis, &report, &mut writer)?;
            writer.flush()?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            flows::render_report(&analysis, &report, &mut handle)?;
        }
    }

    if report.is_empty() {
        log::info!("no information flows found");
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--version") {
        println!("grflow {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    // the logger must exist before the command runs, so the debug switch is
    // picked out of the raw arguments
    let default_level = if args.iter().any(|arg| arg == "--debug") {
        "debug"
    } else {
        "info"
    };
    init_cli_logger("GRFLOW_LOG", default_level);

    let cmd_def = CliCommand::new(&API_METHOD_ANALYZE_POLICY).arg_param(&["policy"]);

    let rpcenv = CliEnvironment::new();
    run_cli_command(cmd_def, rpcenv, None);
}

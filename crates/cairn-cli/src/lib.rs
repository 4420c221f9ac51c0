// Target-specific transitive dependency split (mio/crossterm stack) is accepted for now.
#![allow(clippy::multiple_crate_versions)]

use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use cairn_domain::{ChangeGroup, PlannedChange};
use cairn_engine::{
    ApplyOptions, ApproveAll, Approver, LocalStateBackend, TypeRegistry, UpOptions, plan_up,
};
use cairn_report::{ColorChoice, OutputFormat, RenderOptions, render_apply, render_plan};
use clap::error::ErrorKind;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use log::{LevelFilter, warn};
use minus::{ExitStrategy, Pager, page_all};

mod error;

pub use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "cairn", about = "Declarative infrastructure orchestrator")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', action = ArgAction::Count, global = true)]
    log_level: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Plan and apply the configuration rooted at a file.
    Up {
        root: PathBuf,
        /// Trust recorded state instead of refreshing it from providers.
        #[arg(long)]
        skip_refresh: bool,
        /// Approve every change group without prompting.
        #[arg(long, short = 'y')]
        yes: bool,
        /// Stop at the plan.
        #[arg(long)]
        dry_run: bool,
        /// Keep executing a group after one of its changes fails.
        #[arg(long)]
        keep_going: bool,
        #[command(flatten)]
        render: RenderFlags,
        #[arg(long, value_enum, default_value_t = FormatArg::Text)]
        format: FormatArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Args)]
struct RenderFlags {
    #[arg(long, value_enum, default_value_t = ColorArg::Auto)]
    color: ColorArg,
    #[arg(long)]
    verbose: bool,
}

impl RenderFlags {
    fn render_options(&self, target: &str) -> RenderOptions {
        RenderOptions {
            color: self.color.into(),
            verbose: self.verbose,
            target: Some(target.to_string()),
        }
    }
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Text => Self::Text,
            FormatArg::Json => Self::Json,
        }
    }
}

impl From<ColorArg> for ColorChoice {
    fn from(value: ColorArg) -> Self {
        match value {
            ColorArg::Auto => Self::Auto,
            ColorArg::Always => Self::Always,
            ColorArg::Never => Self::Never,
        }
    }
}

/// Asks on the terminal before each change group runs.
struct PromptApprover {
    interactive: bool,
}

impl Approver for PromptApprover {
    fn approve(&self, group: ChangeGroup, changes: &[&PlannedChange]) -> bool {
        if !self.interactive {
            warn!(
                "stdin is not a terminal; declining {} change(s) (pass --yes to approve)",
                group.describe()
            );
            return false;
        }
        let prompt = format!(
            "Apply {} {} change(s)?",
            changes.len(),
            group.describe()
        );
        match Confirm::new().with_prompt(prompt).default(true).interact() {
            Ok(answer) => answer,
            Err(error) => {
                warn!("confirmation prompt failed: {error}");
                false
            }
        }
    }
}

/// Run the CLI using process arguments.
///
/// # Errors
///
/// Returns an error when argument parsing fails (excluding help/version) or
/// planning fails.
pub fn run() -> std::result::Result<i32, CliError> {
    run_from(std::env::args_os())
}

fn run_from<I, T>(args: I) -> std::result::Result<i32, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(error.into()),
        },
    };
    init_logging(cli.log_level);

    match cli.command {
        Commands::Up {
            root,
            skip_refresh,
            yes,
            dry_run,
            keep_going,
            render,
            format,
        } => {
            let registry = Arc::new(TypeRegistry::builtin());
            let backend = LocalStateBackend;
            let mut session = plan_up(&root, registry, &backend, UpOptions { skip_refresh })?;

            let render_options = render.render_options(&root.display().to_string());
            let output_format: OutputFormat = format.into();
            let plan = &session.plan;

            if plan.has_errors() || !plan.has_changes() || dry_run {
                let rendered = render_plan(plan, output_format, &render_options)?;
                emit_output(&rendered, output_format, true);
                return Ok(i32::from(plan.has_errors()));
            }

            // JSON runs emit a single document: the apply report embeds the plan.
            if output_format == OutputFormat::Text {
                let rendered = render_plan(plan, output_format, &render_options)?;
                emit_output(&rendered, output_format, yes);
            }

            let options = ApplyOptions {
                fail_fast: !keep_going,
            };
            let report = if yes {
                session.apply(&backend, &ApproveAll, options)
            } else {
                let approver = PromptApprover {
                    interactive: std::io::stdin().is_terminal(),
                };
                session.apply(&backend, &approver, options)
            };

            let rendered = render_apply(&report, output_format, &render_options)?;
            emit_output(&rendered, output_format, true);
            Ok(i32::from(report.has_failures()))
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // RUST_LOG, when set, overrides the flag.
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .try_init();
}

fn emit_output(rendered: &str, format: OutputFormat, allow_pager: bool) {
    if allow_pager
        && format == OutputFormat::Text
        && should_use_pager()
        && page_output(rendered).is_ok()
    {
        return;
    }

    if rendered.ends_with('\n') {
        print!("{rendered}");
    } else {
        println!("{rendered}");
    }
}

fn should_use_pager() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_PAGER").is_none()
}

fn page_output(rendered: &str) -> std::result::Result<(), minus::MinusError> {
    let pager = Pager::new();
    pager.set_exit_strategy(ExitStrategy::PagerQuit)?;
    pager.set_text(rendered)?;
    page_all(pager)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::ffi::OsString;
    use std::fs;

    use super::{Cli, Commands, run_from};
    use clap::Parser;

    #[test]
    fn up_flags_parse() {
        let cli = Cli::try_parse_from([
            "cairn",
            "-vv",
            "up",
            "site.cairn",
            "--skip-refresh",
            "--yes",
            "--format",
            "json",
        ])
        .expect("arguments parse");
        assert_eq!(cli.log_level, 2);
        let Commands::Up {
            root,
            skip_refresh,
            yes,
            dry_run,
            ..
        } = cli.command;
        assert_eq!(root.to_str(), Some("site.cairn"));
        assert!(skip_refresh);
        assert!(yes);
        assert!(!dry_run);
    }

    #[test]
    fn missing_root_argument_is_a_parse_error() {
        let error = run_from(["cairn", "up"]).expect_err("root is required");
        assert!(matches!(error, super::CliError::ArgumentParse(_)));
    }

    #[test]
    fn help_exits_zero() {
        assert_eq!(run_from(["cairn", "--help"]).expect("help renders"), 0);
    }

    #[test]
    fn up_with_yes_applies_and_exits_zero() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("main.cairn");
        let target = temp.path().join("hello.txt");
        fs::write(
            &config,
            format!(
                "local::file hello\n  path: '{}'\n  content: 'hi'\nend\n",
                target.display()
            ),
        )
        .expect("write config");

        let args: Vec<OsString> = vec![
            "cairn".into(),
            "up".into(),
            config.into_os_string(),
            "--yes".into(),
            "--color".into(),
            "never".into(),
        ];
        let code = run_from(args).expect("run succeeds");
        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(&target).expect("file created"), "hi");
    }
}

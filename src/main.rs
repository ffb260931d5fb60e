use chrono::Local;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use regex::Regex;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use strata::config::CONFIG_FILE;
use strata::plan::edit::rework_scripts;
use strata::{
    Change, Config, DeployOptions, Engine, Error, EventFilter, EventKind, Plan, Planner,
    Progress, Result, RevertOptions, RevertOutcome, ScriptKind, Target,
};

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about = "Database schema change management: plan, deploy, verify and revert SQL changes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Target name from strata.toml or a database path
    #[arg(short, long, global = true)]
    target: Option<String>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new project: plan file, script directories and strata.toml
    Init {
        /// Project name
        project: String,

        /// Project URI, recorded in the plan and the registry
        #[arg(long)]
        uri: Option<String>,
    },

    /// Add a change to the plan and create its scripts
    Add {
        name: String,

        /// Required change (`name` or `name@tag`), repeatable
        #[arg(short, long = "requires")]
        requires: Vec<String>,

        /// Conflicting change, repeatable
        #[arg(short, long = "conflicts")]
        conflicts: Vec<String>,

        #[arg(short, long)]
        note: Option<String>,
    },

    /// Tag the last change in the plan
    Tag {
        name: String,

        #[arg(short, long)]
        note: Option<String>,
    },

    /// Add a new instance of an existing change, keeping the old scripts
    Rework {
        name: String,

        #[arg(short, long)]
        note: Option<String>,
    },

    /// Deploy pending changes
    Deploy {
        /// Stop after this change (`name`, `@tag`, `name@tag`)
        #[arg(long)]
        to: Option<String>,

        /// Deploy only the --to change
        #[arg(long, requires = "to")]
        only: bool,

        /// What to revert on failure: all, tag or change
        #[arg(long)]
        mode: Option<String>,

        /// Run verify scripts inside each deploy
        #[arg(long)]
        verify: bool,
    },

    /// Revert deployed changes
    Revert {
        /// Keep this change and everything before it
        #[arg(long)]
        to: Option<String>,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Run the verify script of every deployed change
    Verify,

    /// Show deployed and pending changes
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show the event log, newest first
    Log {
        /// Event kind (deploy, revert, fail, merge), repeatable
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// Exact change name
        #[arg(long)]
        change: Option<String>,

        /// Regex on the change name
        #[arg(long)]
        change_pattern: Option<String>,

        /// Regex on the committer name
        #[arg(long)]
        committer: Option<String>,

        /// Show at most this many events
        #[arg(short = 'n', long)]
        max_count: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Print the plan in canonical form
    Plan,

    /// Generate shell completion script
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    strata::logging::init(cli.verbose);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Dispatch one command. `Ok(false)` means it ran but reported failure.
fn run(cli: Cli) -> Result<bool> {
    if let Command::Completion { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "strata", &mut io::stdout());
        return Ok(true);
    }

    let config = Config::load()?;
    let target = cli.target.as_deref();

    match cli.command {
        Command::Init { project, uri } => init(&config, &project, uri.as_deref(), target),
        Command::Add {
            name,
            requires,
            conflicts,
            note,
        } => add(&config, &name, &requires, &conflicts, note.as_deref()),
        Command::Tag { name, note } => {
            let plan_path = config.plan_path();
            let plan = Plan::load(&plan_path)?;
            let plan = plan.add_tag(&name, note.as_deref(), &planner(&config), Local::now().fixed_offset())?;
            plan.save(&plan_path)?;
            if let Some(tag) = plan.tags().last() {
                println!("{} Tagged \"{}\" with {}", "✓".green(), tag.change, tag.format_name().cyan());
            }
            Ok(true)
        }
        Command::Rework { name, note } => rework(&config, &name, note.as_deref()),
        Command::Deploy {
            to,
            only,
            mode,
            verify,
        } => {
            let engine = open_engine(&config, target)?;
            let options = DeployOptions {
                to,
                only,
                mode: match mode {
                    Some(mode) => mode.parse()?,
                    None => config.deploy.mode,
                },
                verify: verify || config.deploy.verify,
            };
            println!("Deploying changes to {}", engine.target().name.cyan());
            let report = engine.deploy(&options, &mut Printer)?;
            for tag in &report.tags {
                println!("  recorded tag {}", tag.cyan());
            }
            if report.deployed.is_empty() {
                println!("Nothing to deploy (up-to-date)");
            }
            Ok(true)
        }
        Command::Revert { to, yes } => {
            let engine = open_engine(&config, target)?;
            let ask = !yes && config.revert.prompt;
            let outcome = engine.revert(
                &RevertOptions { to },
                &mut |changes: &[&Change]| !ask || confirm_revert(engine.target(), changes),
                &mut Printer,
            )?;
            match outcome {
                RevertOutcome::Reverted(changes) => {
                    println!("{} Reverted {} change(s)", "✓".green(), changes.len());
                }
                RevertOutcome::Declined => println!("Nothing reverted"),
                RevertOutcome::NothingToRevert => println!("No changes deployed"),
            }
            Ok(true)
        }
        Command::Verify => {
            let engine = open_engine(&config, target)?;
            println!("Verifying {}", engine.target().name.cyan());
            let report = engine.verify(&mut Printer)?;
            let failures: Vec<_> = report.failures().collect();
            for failure in &failures {
                if let Some(error) = &failure.error {
                    eprintln!("  {} {}", failure.change.red(), error);
                }
            }
            if failures.is_empty() {
                println!("Verify successful");
            } else {
                println!("{} of {} change(s) failed verification", failures.len(), report.results.len());
            }
            Ok(report.is_success())
        }
        Command::Status { json } => {
            let engine = open_engine(&config, target)?;
            let status = engine.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(true);
            }
            println!("# On target {}", status.target.cyan());
            println!("# Project:  {}", status.project);
            match status.last() {
                Some(last) => {
                    println!("# Change:   {}", last.change_id);
                    println!("# Name:     {}", last.change);
                    println!("# Deployed: {}", last.committed_at);
                    println!("# By:       {} <{}>", last.committer_name, last.committer_email);
                }
                None => println!("No changes deployed"),
            }
            if !status.tags.is_empty() {
                println!("# Tags:     {}", status.tags.join(", "));
            }
            if status.is_up_to_date() {
                println!("Nothing to deploy (up-to-date)");
            } else {
                println!("Undeployed change(s):");
                for name in &status.pending {
                    println!("  * {}", name.yellow());
                }
            }
            Ok(true)
        }
        Command::Log {
            events,
            change,
            change_pattern,
            committer,
            max_count,
            json,
        } => {
            let engine = open_engine(&config, target)?;
            let filter = EventFilter {
                change,
                change_pattern: change_pattern.as_deref().map(compile).transpose()?,
                committer_pattern: committer.as_deref().map(compile).transpose()?,
                events: events
                    .iter()
                    .map(|e| e.parse::<EventKind>())
                    .collect::<Result<Vec<_>>>()?,
                project: None,
                limit: max_count,
            };
            let events = engine.log(filter)?.collect::<Result<Vec<_>>>()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
                return Ok(true);
            }
            for event in &events {
                let kind = match event.kind() {
                    Some(EventKind::Deploy) => event.event.green(),
                    Some(EventKind::Revert) => event.event.blue(),
                    Some(EventKind::Fail) => event.event.red(),
                    _ => event.event.normal(),
                };
                println!(
                    "{:<7} {} {} {} <{}>",
                    kind,
                    event.change.bold(),
                    event.committed_at.dimmed(),
                    event.committer_name,
                    event.committer_email
                );
            }
            Ok(true)
        }
        Command::Plan => {
            let plan = Plan::load(config.plan_path())?;
            print!("{}", plan.to_text());
            Ok(true)
        }
        Command::Completion { .. } => Ok(true),
    }
}

fn planner(config: &Config) -> Planner {
    Planner::from(&config.identity())
}

fn open_engine(config: &Config, target: Option<&str>) -> Result<Engine> {
    let target = Target::resolve(config, target)?;
    let plan = Plan::load(config.plan_path())?;
    Engine::open(plan, target, config.identity())
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Validation(format!("invalid pattern \"{}\": {}", pattern, e)))
}

fn init(config: &Config, project: &str, uri: Option<&str>, target: Option<&str>) -> Result<bool> {
    let plan_path = config.plan_path();
    if plan_path.exists() {
        return Err(Error::Validation(format!(
            "{} already exists",
            plan_path.display()
        )));
    }
    Plan::init(project, uri)?.save(&plan_path)?;

    let top_dir = config.top_dir();
    for kind in ScriptKind::ALL {
        let dir = top_dir.join(kind.dir());
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    }

    let config_path = config.root.join(CONFIG_FILE);
    if !config_path.exists() {
        let mut fresh = config.clone();
        fresh.core.target = target.map(str::to_string).or(fresh.core.target);
        fresh.save(&config_path)?;
    }

    println!("{} Initialized project {}", "✓".green(), project.cyan());
    println!("  Plan:   {}", plan_path.display());
    println!("  Config: {}", config_path.display());
    Ok(true)
}

fn add(
    config: &Config,
    name: &str,
    requires: &[String],
    conflicts: &[String],
    note: Option<&str>,
) -> Result<bool> {
    let plan_path = config.plan_path();
    let plan = Plan::load(&plan_path)?;
    let plan = plan.add_change(
        name,
        requires,
        conflicts,
        note,
        &planner(config),
        Local::now().fixed_offset(),
    )?;

    let top_dir = config.top_dir();
    if let Some(change) = plan.last_change() {
        for kind in ScriptKind::ALL {
            let path = top_dir.join(change.script_path(kind));
            if !path.exists() {
                write_stub(&path, &stub_header(plan.project(), name, kind))?;
                println!("  Created {}", path.display());
            }
        }
    }
    plan.save(&plan_path)?;
    println!("{} Added \"{}\" to {}", "✓".green(), name.cyan(), plan_path.display());
    Ok(true)
}

fn rework(config: &Config, name: &str, note: Option<&str>) -> Result<bool> {
    let plan_path = config.plan_path();
    let plan = Plan::load(&plan_path)?;
    let tag = plan.rework_anchor(name)?;
    let reworked = plan.rework_change(name, note, &planner(config), Local::now().fixed_offset())?;

    for path in rework_scripts(&config.top_dir(), name, &tag)? {
        println!("  Copied {}", path.display());
    }
    reworked.save(&plan_path)?;
    println!(
        "{} Reworked \"{}\"; the previous instance is {}@{}",
        "✓".green(),
        name.cyan(),
        name,
        tag
    );
    Ok(true)
}

fn stub_header(project: &str, name: &str, kind: ScriptKind) -> String {
    let (verb, preposition) = match kind {
        ScriptKind::Deploy => ("Deploy", "to"),
        ScriptKind::Revert => ("Revert", "from"),
        ScriptKind::Verify => ("Verify", "on"),
    };
    format!("-- {} {}:{} {} sqlite\n", verb, project, name, preposition)
}

fn write_stub(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| Error::io(path, e))
}

/// Ask on stdin before reverting. Anything but y/yes declines.
fn confirm_revert(target: &Target, changes: &[&Change]) -> bool {
    println!("Revert the following changes from {}?", target.name.cyan());
    for change in changes {
        println!("  - {}", change.format_name());
    }
    print!("[y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Prints `+ users .. ok` as each script runs.
struct Printer;

impl Progress for Printer {
    fn start(&mut self, kind: ScriptKind, change: &Change) {
        let symbol = match kind {
            ScriptKind::Deploy => "+",
            ScriptKind::Revert => "-",
            ScriptKind::Verify => "*",
        };
        print!("  {} {} ..", symbol, change.format_name());
        let _ = io::stdout().flush();
    }

    fn finish(&mut self, ok: bool) {
        if ok {
            println!(" {}", "ok".green());
        } else {
            println!(" {}", "not ok".red());
        }
    }
}

use std::{error::Error, path::Path, process::ExitCode};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use servebench::{
    cleanup,
    cli::{BenchOptions, Cli, Commands, Which, parse_args},
    config::{RunConfig, Settings, load_config},
    git::GitRepo,
    logs::LogSink,
    runner::{
        BenchmarkRunner, BranchPlan, EvalOptions, EvalRunner, ProfileOptions, ProfileRunner,
        eval::summarize,
    },
    supervisor::ProcessSupervisor,
    variant::variants_or_default,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(args: Cli) -> Result<u8, Box<dyn Error>> {
    match args.command {
        Commands::Logs {
            channel,
            log_dir,
            lines,
            follow,
        } => {
            show_logs(&LogSink::new(log_dir), &channel, lines, follow);
            Ok(0)
        }
        Commands::Compare {
            bench,
            main_ref,
            pr_ref,
            which,
            build_main,
            build_pr,
            pull_latest,
            pull_latest_main,
            pull_latest_pr,
            re_run_main,
            re_run_pr,
            results_main,
            results_pr,
            server_args_main,
            server_args_pr,
            variants,
            variants_main,
            variants_pr,
        } => {
            let pr_ref = match (which, pr_ref) {
                (Which::Main, pr_ref) => pr_ref,
                (_, Some(pr_ref)) => Some(pr_ref),
                (_, None) => return Err("--pr-ref is required unless --which main".into()),
            };

            let settings = resolve_bench_settings(args.config.as_deref(), &bench)?;
            let shared = variants.or_else(|| settings.variants.clone());
            let mut plans = Vec::new();

            if which.includes_main() {
                plans.push(BranchPlan {
                    label: "MAIN".into(),
                    reference: Some(main_ref),
                    variants: variants_or_default(
                        variants_main.or_else(|| shared.clone()).as_deref(),
                        &server_args_main,
                    )?,
                    results_dir: results_main.unwrap_or_else(|| {
                        settings.out_base.join(format!(
                            "bench_main_{}_{}",
                            settings.terse_name, settings.dataset
                        ))
                    }),
                    build: build_main,
                    pull: pull_latest || pull_latest_main,
                    force_rerun: re_run_main,
                });
            }

            if which.includes_pr() {
                plans.push(BranchPlan {
                    label: "PR".into(),
                    reference: pr_ref,
                    variants: variants_or_default(
                        variants_pr.or_else(|| shared.clone()).as_deref(),
                        &server_args_pr,
                    )?,
                    results_dir: results_pr.unwrap_or_else(|| {
                        settings.out_base.join(format!(
                            "bench_pr_{}_{}",
                            settings.terse_name, settings.dataset
                        ))
                    }),
                    build: build_pr,
                    pull: pull_latest || pull_latest_pr,
                    force_rerun: re_run_pr,
                });
            }

            let git = GitRepo::open(&settings.repo_dir, Some(settings.venv.clone()))?;
            let supervisor = ProcessSupervisor::new(LogSink::new(&settings.log_dir));
            let _cleanup = cleanup::install(&supervisor)?;

            let runner = BenchmarkRunner::new(settings, supervisor)?.with_resume(bench.resume);
            runner.run_plans("Benchmark Comparison", Some(&git), &plans)?;
            Ok(0)
        }
        Commands::Bench {
            bench,
            branch,
            build,
            pull_latest,
            results_dir,
            variants,
        } => {
            let settings = resolve_bench_settings(args.config.as_deref(), &bench)?;
            let needs_git = branch.is_some() || build || pull_latest;
            let git = match GitRepo::open(&settings.repo_dir, Some(settings.venv.clone())) {
                Ok(git) => Some(git),
                Err(err) if needs_git => return Err(err.into()),
                Err(err) => {
                    warn!("{err}; benchmarking without git information");
                    None
                }
            };
            if let Some(git) = &git
                && branch.is_none()
            {
                match git.current_branch() {
                    Ok(current) => info!("Benchmarking current branch '{current}'"),
                    Err(err) => warn!("Could not determine current git branch: {err}"),
                }
            }

            let plan = BranchPlan {
                label: "BENCH".into(),
                reference: branch,
                variants: variants_or_default(
                    variants.or_else(|| settings.variants.clone()).as_deref(),
                    "",
                )?,
                results_dir: results_dir.unwrap_or_else(|| {
                    settings.out_base.join(format!(
                        "bench_{}_{}",
                        settings.terse_name, settings.dataset
                    ))
                }),
                build,
                pull: pull_latest,
                force_rerun: false,
            };

            let supervisor = ProcessSupervisor::new(LogSink::new(&settings.log_dir));
            let _cleanup = cleanup::install(&supervisor)?;

            let runner = BenchmarkRunner::new(settings, supervisor)?.with_resume(bench.resume);
            runner.run_plans("Benchmark (Single Branch)", git.as_ref(), &[plan])?;
            Ok(0)
        }
        Commands::Eval {
            server,
            task,
            limit,
            num_concurrent,
            batch_size,
            server_args,
            timeout,
        } => {
            let file = load_config(args.config.as_deref())?;
            let settings = Settings::resolve(
                file.merge(server.to_run_config()),
                &format!("./{task}-results"),
            )?;

            let options = EvalOptions {
                task: task.clone(),
                limit,
                num_concurrent,
                batch_size,
                timeout: std::time::Duration::from_secs(timeout),
            };

            let supervisor = ProcessSupervisor::new(LogSink::new(&settings.log_dir));
            let _cleanup = cleanup::install(&supervisor)?;

            let runner = EvalRunner::new(settings, supervisor)?;
            runner.transcript().banner(
                &format!("{task} Evaluation"),
                &[
                    ("Limit", limit.map_or("none".into(), |limit| limit.to_string())),
                    ("Concurrent", num_concurrent.to_string()),
                    (
                        "Server args",
                        if server_args.is_empty() {
                            "none".into()
                        } else {
                            server_args.clone()
                        },
                    ),
                ],
            );

            let code = runner.run_evaluation(&server_args, &options)?;
            if code == 0 {
                match runner.find_results() {
                    Some(path) => match summarize(&path, &task) {
                        Ok(summary) => {
                            println!("{summary}");
                            println!("Results: {}", path.display());
                        }
                        Err(err) => warn!("{err}"),
                    },
                    None => warn!("Results file not found"),
                }
            }
            Ok(u8::try_from(code.clamp(0, 255)).unwrap_or(1))
        }
        Commands::Profile {
            server,
            random_in,
            random_out,
            num_prompts,
            tensor_parallel_size,
            server_args,
            profile_dir,
            timeout,
        } => {
            let file = load_config(args.config.as_deref())?;
            let overrides = RunConfig {
                random_in,
                random_out,
                tensor_parallel_size,
                ..Default::default()
            };
            let settings = Settings::resolve(
                file.merge(server.to_run_config()).merge(overrides),
                &profile_dir.display().to_string(),
            )?;

            let options = ProfileOptions {
                profile_dir,
                num_prompts,
                timeout: std::time::Duration::from_secs(timeout),
            };

            let supervisor = ProcessSupervisor::new(LogSink::new(&settings.log_dir));
            let _cleanup = cleanup::install(&supervisor)?;

            let runner = ProfileRunner::new(settings.clone(), supervisor, options)?;
            runner.transcript().banner(
                "vLLM Profiling",
                &[
                    ("Model", settings.model.clone()),
                    ("Tensor parallel", settings.tensor_parallel_size.to_string()),
                    (
                        "Input/Output",
                        format!("{}/{}", settings.random_in, settings.random_out),
                    ),
                    ("Prompts", num_prompts.to_string()),
                    ("Profile dir", runner.profile_dir().display().to_string()),
                ],
            );

            let code = runner.run_profile(&server_args)?;
            Ok(u8::try_from(code.clamp(0, 255)).unwrap_or(1))
        }
    }
}

fn resolve_bench_settings(
    config_path: Option<&Path>,
    bench: &BenchOptions,
) -> Result<Settings, Box<dyn Error>> {
    let file: RunConfig = load_config(config_path)?;
    Ok(Settings::resolve(
        file.merge(bench.to_run_config()?),
        "./results",
    )?)
}

fn show_logs(logs: &LogSink, channel: &str, lines: usize, follow: bool) {
    for line in logs.tail(channel, lines) {
        println!("{line}");
    }

    if follow {
        for line in logs.follow(channel, logs.end_offset(channel)) {
            println!("{line}");
        }
    }
}

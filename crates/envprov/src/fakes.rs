//! In-memory fakes for the command-runner seam (testing only)
//!
//! `FakeConda` answers every invocation without spawning processes. It keeps
//! a model of created environments and their packages so inventory listings
//! reflect what was actually requested, and it can be told to fail any step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::manager::InstalledPackage;
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::Result;

#[derive(Debug, Default)]
struct CondaModel {
    envs: BTreeMap<String, Vec<InstalledPackage>>,
}

/// Scriptable stand-in for `bash`, `conda`, and the test command.
#[derive(Debug, Default)]
pub struct FakeConda {
    calls: Mutex<Vec<Invocation>>,
    failures: Mutex<HashMap<String, i32>>,
    hidden: Mutex<HashSet<String>>,
    model: Mutex<CondaModel>,
}

impl FakeConda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every invocation whose step is `step` exit with `exit_code`.
    pub fn fail_on(&self, step: &str, exit_code: i32) {
        self.failures
            .lock()
            .unwrap()
            .insert(step.to_string(), exit_code);
    }

    /// Leave `package` out of inventory listings even after it was installed.
    pub fn hide_from_inventory(&self, package: &str) {
        self.hidden.lock().unwrap().insert(package.to_string());
    }

    /// Every invocation received, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Step names of every invocation received, in order.
    pub fn steps(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.step).collect()
    }

    pub fn count_step(&self, step: &str) -> usize {
        self.calls().iter().filter(|c| c.step == step).count()
    }

    /// Package names currently installed in `env`, in install order.
    pub fn installed(&self, env: &str) -> Option<Vec<String>> {
        let model = self.model.lock().unwrap();
        model
            .envs
            .get(env)
            .map(|pkgs| pkgs.iter().map(|p| p.name.clone()).collect())
    }

    pub fn env_exists(&self, env: &str) -> bool {
        self.model.lock().unwrap().envs.contains_key(env)
    }

    fn apply(&self, invocation: &Invocation) -> CommandOutput {
        if invocation.program_name() != "conda" {
            return ok("");
        }

        let parsed = ParsedConda::parse(&invocation.args);
        let mut model = self.model.lock().unwrap();
        match parsed.verb.as_slice() {
            ["create"] => {
                let Some(name) = parsed.env_name else {
                    return failed("create requires -n");
                };
                let mut pkgs = Vec::new();
                for spec in &parsed.specs {
                    upsert(&mut pkgs, package_from_spec(spec, parsed.channel.as_deref()));
                }
                model.envs.insert(name, pkgs);
                ok("")
            }
            ["install"] => {
                let Some(name) = parsed.env_name else {
                    return failed("install requires -n");
                };
                let Some(pkgs) = model.envs.get_mut(&name) else {
                    return failed("EnvironmentLocationNotFound");
                };
                for spec in &parsed.specs {
                    upsert(pkgs, package_from_spec(spec, parsed.channel.as_deref()));
                }
                ok("")
            }
            ["list"] => {
                let Some(name) = parsed.env_name else {
                    return failed("list requires -n");
                };
                let Some(pkgs) = model.envs.get(&name) else {
                    return failed("EnvironmentLocationNotFound");
                };
                let hidden = self.hidden.lock().unwrap();
                let visible: Vec<&InstalledPackage> =
                    pkgs.iter().filter(|p| !hidden.contains(&p.name)).collect();
                match serde_json::to_string(&visible) {
                    Ok(json) => ok(&json),
                    Err(e) => failed(&e.to_string()),
                }
            }
            ["env", "remove"] => {
                if let Some(name) = parsed.env_name {
                    model.envs.remove(&name);
                }
                ok("")
            }
            _ => ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeConda {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        if let Some(code) = self.failures.lock().unwrap().get(&invocation.step) {
            return Ok(CommandOutput {
                exit_code: *code,
                stdout: String::new(),
                stderr: format!("{} failed (scripted)", invocation.step),
                duration_ms: 0,
            });
        }

        Ok(self.apply(invocation))
    }
}

#[derive(Debug, Default)]
struct ParsedConda {
    verb: Vec<&'static str>,
    env_name: Option<String>,
    channel: Option<String>,
    specs: Vec<String>,
}

impl ParsedConda {
    fn parse(args: &[String]) -> Self {
        const VERBS: [&str; 6] = ["create", "install", "list", "env", "remove", "clean"];
        let mut parsed = ParsedConda::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-n" => parsed.env_name = iter.next().cloned(),
                "-c" => parsed.channel = iter.next().cloned(),
                a if a.starts_with('-') => {}
                a => match VERBS.iter().find(|v| **v == a) {
                    Some(v) if parsed.specs.is_empty() => parsed.verb.push(*v),
                    _ => parsed.specs.push(a.to_string()),
                },
            }
        }
        parsed
    }
}

fn package_from_spec(spec: &str, channel: Option<&str>) -> InstalledPackage {
    let (name, version) = spec.split_once('=').unwrap_or((spec, "0.0.0"));
    InstalledPackage {
        name: name.to_string(),
        version: version.to_string(),
        channel: channel.map(str::to_string),
    }
}

fn upsert(pkgs: &mut Vec<InstalledPackage>, pkg: InstalledPackage) {
    match pkgs.iter_mut().find(|p| p.name == pkg.name) {
        Some(existing) => *existing = pkg,
        None => pkgs.push(pkg),
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration_ms: 0,
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration_ms: 0,
    }
}

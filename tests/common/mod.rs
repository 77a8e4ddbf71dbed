//! Simulated host for integration tests
//!
//! `FakeHost` interprets the Linux (`ip`, `systemctl`, `gsettings`) and
//! macOS (`networksetup`, `launchctl`) commands the library issues, keeping
//! links, routes, installed files, services and proxy settings in memory.

#![allow(dead_code)]

use async_trait::async_trait;
use libxstream::error::{XstreamError, XstreamResult};
use libxstream::privilege::{PrivilegeCredential, PrivilegedExecutor};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const UNIT_DIR: &str = "/etc/systemd/system";
pub const GNOME_SCHEMA: &str = "org.gnome.system.proxy";

#[derive(Debug, Clone, Default)]
pub struct Link {
    pub up: bool,
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InstalledFile {
    pub content: String,
    pub mode: Option<String>,
    pub owner: Option<String>,
}

#[derive(Debug, Default)]
pub struct HostState {
    pub links: HashMap<String, Link>,
    /// `"<network> dev <interface>"`
    pub routes: BTreeSet<String>,
    pub files: BTreeMap<PathBuf, InstalledFile>,
    pub active_units: BTreeSet<String>,
    pub enabled_units: BTreeSet<String>,
    pub daemon_reloads: usize,
    pub gnome_schema: bool,
    pub gnome: BTreeMap<String, String>,
    pub network_services: Vec<String>,
    pub socks: BTreeMap<String, (String, String, bool)>,
    pub commands: Vec<String>,
}

struct Failure {
    pattern: String,
    output: String,
    remaining: Option<usize>,
}

struct Hold {
    pattern: String,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

pub struct FakeHost {
    state: Mutex<HostState>,
    failures: Mutex<Vec<Failure>>,
    hold: Mutex<Option<Hold>>,
    password: Option<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeHost {
    /// Linux host with `eth0` and a `tun0` device left down by the relay
    pub fn linux() -> Self {
        let mut state = HostState::default();
        state.links.insert(
            "eth0".into(),
            Link { up: true, addrs: vec!["192.168.1.20/24".into()] },
        );
        state.links.insert("tun0".into(), Link::default());
        state.routes.insert("default dev eth0".into());
        state.routes.insert("192.168.1.0/24 dev eth0".into());
        state.gnome_schema = true;
        state.gnome.insert("mode".into(), "none".into());
        Self::with_state(state)
    }

    /// macOS host with three network services
    pub fn macos() -> Self {
        let mut state = HostState::default();
        state.network_services = vec![
            "Wi-Fi".into(),
            "USB 10/100 LAN".into(),
            "*Thunderbolt Bridge".into(),
        ];
        Self::with_state(state)
    }

    pub fn with_state(state: HostState) -> Self {
        Self {
            state: Mutex::new(state),
            failures: Mutex::new(Vec::new()),
            hold: Mutex::new(None),
            password: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Reject every credential except `password`
    pub fn requiring_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Fail commands containing `pattern` with `output`
    pub fn fail_on(&self, pattern: &str, output: &str) {
        self.failures.lock().unwrap().push(Failure {
            pattern: pattern.into(),
            output: output.into(),
            remaining: None,
        });
    }

    pub fn fail_once(&self, pattern: &str, output: &str) {
        self.failures.lock().unwrap().push(Failure {
            pattern: pattern.into(),
            output: output.into(),
            remaining: Some(1),
        });
    }

    /// Park the first command containing `pattern` until the returned
    /// release handle is notified; `reached` fires when it parks
    pub fn hold_on(&self, pattern: &str) -> (Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(Hold {
            pattern: pattern.into(),
            reached: reached.clone(),
            release: release.clone(),
        });
        (reached, release)
    }

    pub fn state<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn routes(&self) -> BTreeSet<String> {
        self.state(|s| s.routes.clone())
    }

    pub fn commands(&self) -> Vec<String> {
        self.state(|s| s.commands.clone())
    }

    pub fn file(&self, path: &str) -> Option<InstalledFile> {
        self.state(|s| s.files.get(&PathBuf::from(path)).cloned())
    }

    pub fn files_under(&self, dir: &str) -> Vec<PathBuf> {
        self.state(|s| {
            s.files
                .keys()
                .filter(|p| p.starts_with(dir))
                .cloned()
                .collect()
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, command: &str) -> Option<String> {
        let mut failures = self.failures.lock().unwrap();
        let index = failures.iter().position(|f| {
            command.contains(&f.pattern) && f.remaining.map(|n| n > 0).unwrap_or(true)
        })?;
        let failure = &mut failures[index];
        if let Some(n) = failure.remaining.as_mut() {
            *n -= 1;
        }
        Some(failure.output.clone())
    }

    fn take_hold(&self, command: &str) -> Option<(Arc<Notify>, Arc<Notify>)> {
        let mut hold = self.hold.lock().unwrap();
        if hold.as_ref().map(|h| command.contains(&h.pattern)).unwrap_or(false) {
            hold.take().map(|h| (h.reached, h.release))
        } else {
            None
        }
    }

    fn execute(&self, command: &str) -> Result<String, (i32, String)> {
        let mut output = String::new();
        for step in command.split(" && ") {
            let words = tokenize(step);
            let mut state = self.state.lock().unwrap();
            output.push_str(&run_step(&mut state, &words)?);
        }
        Ok(output)
    }
}

#[async_trait]
impl PrivilegedExecutor for FakeHost {
    async fn run(&self, command: &str, credential: &PrivilegeCredential) -> XstreamResult<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.run_inner(command, credential).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl FakeHost {
    async fn run_inner(&self, command: &str, credential: &PrivilegeCredential) -> XstreamResult<String> {
        if let Some(expected) = &self.password {
            if credential.expose_secret() != expected {
                return Err(XstreamError::AuthRejected("sudo refused the supplied credential".into()));
            }
        }

        self.state(|s| s.commands.push(command.to_string()));

        if let Some((reached, release)) = self.take_hold(command) {
            reached.notify_one();
            release.notified().await;
        }

        if let Some(output) = self.injected_failure(command) {
            return Err(XstreamError::CommandFailed {
                cmd: command.to_string(),
                code: Some(1),
                output,
            });
        }

        self.execute(command).map_err(|(code, output)| XstreamError::CommandFailed {
            cmd: command.to_string(),
            code: Some(code),
            output,
        })
    }
}

/// Minimal `/bin/sh` word splitting: whitespace, single and double quotes
pub fn tokenize(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn fail(code: i32, output: impl Into<String>) -> Result<String, (i32, String)> {
    Err((code, output.into()))
}

fn run_step(state: &mut HostState, words: &[String]) -> Result<String, (i32, String)> {
    let args: Vec<&str> = words.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["ip", rest @ ..] => run_ip(state, rest),
        ["mkdir", "-p", _dir] => Ok(String::new()),
        ["cp", src, dest] => {
            let content = match std::fs::read_to_string(src) {
                Ok(content) => content,
                Err(e) => return fail(1, format!("cp: cannot stat '{}': {}", src, e)),
            };
            state.files.insert(
                PathBuf::from(dest),
                InstalledFile { content, mode: None, owner: None },
            );
            Ok(String::new())
        }
        ["chmod", mode, path] => match state.files.get_mut(&PathBuf::from(path)) {
            Some(file) => {
                file.mode = Some(mode.to_string());
                Ok(String::new())
            }
            None => fail(1, format!("chmod: cannot access '{}': No such file or directory", path)),
        },
        ["chown", owner, path] => match state.files.get_mut(&PathBuf::from(path)) {
            Some(file) => {
                file.owner = Some(owner.to_string());
                Ok(String::new())
            }
            None => fail(1, format!("chown: cannot access '{}': No such file or directory", path)),
        },
        ["rm", "-f", paths @ ..] => {
            for path in paths {
                state.files.remove(&PathBuf::from(path));
            }
            Ok(String::new())
        }
        ["systemctl", rest @ ..] => run_systemctl(state, rest),
        ["gsettings", rest @ ..] => run_gsettings(state, rest),
        ["networksetup", rest @ ..] => run_networksetup(state, rest),
        ["launchctl", rest @ ..] => run_launchctl(state, rest),
        [program, ..] => fail(127, format!("/bin/sh: 1: {}: not found", program)),
        [] => Ok(String::new()),
    }
}

fn run_ip(state: &mut HostState, args: &[&str]) -> Result<String, (i32, String)> {
    let args: Vec<&str> = args.iter().copied().filter(|a| *a != "-6").collect();
    match args.as_slice() {
        ["-o", "addr", "show", "dev", dev] => match state.links.get(*dev) {
            Some(link) => Ok(link
                .addrs
                .iter()
                .map(|a| format!("7: {}    inet {} scope global {}\n", dev, a, dev))
                .collect()),
            None => fail(1, format!("Device \"{}\" does not exist.", dev)),
        },
        ["addr", "add", addr, "dev", dev] => match state.links.get_mut(*dev) {
            Some(link) if link.addrs.iter().any(|a| a == addr) => fail(2, "RTNETLINK answers: File exists"),
            Some(link) => {
                link.addrs.push(addr.to_string());
                Ok(String::new())
            }
            None => fail(1, format!("Cannot find device \"{}\"", dev)),
        },
        ["-o", "link", "show", "dev", dev] => match state.links.get(*dev) {
            Some(link) => {
                let flags = if link.up {
                    "POINTOPOINT,MULTICAST,NOARP,UP,LOWER_UP"
                } else {
                    "POINTOPOINT,MULTICAST,NOARP"
                };
                Ok(format!("7: {}: <{}> mtu 1500 qdisc fq_codel\n", dev, flags))
            }
            None => fail(1, format!("Device \"{}\" does not exist.", dev)),
        },
        ["link", "set", "dev", dev, updown] => match state.links.get_mut(*dev) {
            Some(link) => {
                link.up = *updown == "up";
                Ok(String::new())
            }
            None => fail(1, format!("Cannot find device \"{}\"", dev)),
        },
        ["route", "show", "exact", net, "dev", dev] => {
            let entry = format!("{} dev {}", net, dev);
            if state.routes.contains(&entry) {
                Ok(format!("{} scope link\n", entry))
            } else {
                Ok(String::new())
            }
        }
        ["route", "add", net, "dev", dev] => {
            if !state.links.contains_key(*dev) {
                return fail(1, format!("Cannot find device \"{}\"", dev));
            }
            if !state.routes.insert(format!("{} dev {}", net, dev)) {
                return fail(2, "RTNETLINK answers: File exists");
            }
            Ok(String::new())
        }
        ["route", "del", net, "dev", dev] => {
            if state.routes.remove(&format!("{} dev {}", net, dev)) {
                Ok(String::new())
            } else {
                fail(2, "RTNETLINK answers: No such process")
            }
        }
        _ => fail(1, format!("ip: unsupported invocation {:?}", args)),
    }
}

fn unit_path(unit: &str) -> PathBuf {
    PathBuf::from(UNIT_DIR).join(unit)
}

fn run_systemctl(state: &mut HostState, args: &[&str]) -> Result<String, (i32, String)> {
    match args {
        ["daemon-reload"] => {
            state.daemon_reloads += 1;
            Ok(String::new())
        }
        ["enable", unit] => {
            if !state.files.contains_key(&unit_path(unit)) {
                return fail(1, format!("Failed to enable unit: Unit file {} does not exist.", unit));
            }
            state.enabled_units.insert(unit.to_string());
            Ok(String::new())
        }
        ["start", unit] => {
            if !state.files.contains_key(&unit_path(unit)) {
                return fail(5, format!("Failed to start {}: Unit {} not found.", unit, unit));
            }
            state.active_units.insert(unit.to_string());
            Ok(String::new())
        }
        ["stop", unit] => {
            if !state.files.contains_key(&unit_path(unit)) && !state.active_units.contains(*unit) {
                return fail(5, format!("Failed to stop {}: Unit {} not loaded.", unit, unit));
            }
            state.active_units.remove(*unit);
            Ok(String::new())
        }
        ["show", "-p", "LoadState,ActiveState", unit] => {
            let load = if state.files.contains_key(&unit_path(unit)) { "loaded" } else { "not-found" };
            let active = if state.active_units.contains(*unit) { "active" } else { "inactive" };
            Ok(format!("LoadState={}\nActiveState={}\n", load, active))
        }
        _ => fail(1, format!("systemctl: unsupported invocation {:?}", args)),
    }
}

fn run_gsettings(state: &mut HostState, args: &[&str]) -> Result<String, (i32, String)> {
    match args {
        ["list-schemas"] => Ok(if state.gnome_schema {
            format!("org.gnome.desktop.interface\n{}\n{}.socks\n", GNOME_SCHEMA, GNOME_SCHEMA)
        } else {
            "org.gnome.desktop.interface\n".to_string()
        }),
        ["set", schema, key, value] if state.gnome_schema => {
            let key = if *schema == GNOME_SCHEMA {
                key.to_string()
            } else {
                format!("{}.{}", schema.trim_start_matches(GNOME_SCHEMA).trim_start_matches('.'), key)
            };
            state.gnome.insert(key, value.to_string());
            Ok(String::new())
        }
        _ => fail(1, format!("gsettings: unsupported invocation {:?}", args)),
    }
}

fn run_networksetup(state: &mut HostState, args: &[&str]) -> Result<String, (i32, String)> {
    match args {
        ["-listallnetworkservices"] => {
            let mut out = String::from("An asterisk (*) denotes that a network service is disabled.\n");
            for service in &state.network_services {
                out.push_str(service);
                out.push('\n');
            }
            Ok(out)
        }
        ["-setsocksfirewallproxy", service, host, port] => {
            let entry = state
                .socks
                .entry(service.to_string())
                .or_insert_with(|| (String::new(), String::new(), false));
            entry.0 = host.to_string();
            entry.1 = port.to_string();
            Ok(String::new())
        }
        ["-setsocksfirewallproxystate", service, on_off] => {
            let entry = state
                .socks
                .entry(service.to_string())
                .or_insert_with(|| (String::new(), String::new(), false));
            entry.2 = *on_off == "on";
            Ok(String::new())
        }
        _ => fail(1, format!("networksetup: unsupported invocation {:?}", args)),
    }
}

fn run_launchctl(state: &mut HostState, args: &[&str]) -> Result<String, (i32, String)> {
    match args {
        ["load", "-w", path] => {
            if !state.files.contains_key(&PathBuf::from(path)) {
                return fail(1, format!("{}: No such file or directory", path));
            }
            state.active_units.insert(path.to_string());
            Ok(String::new())
        }
        ["unload", path] => {
            if state.active_units.remove(*path) {
                Ok(String::new())
            } else {
                fail(1, "Unload failed: Could not find specified service")
            }
        }
        _ => fail(1, format!("launchctl: unsupported invocation {:?}", args)),
    }
}

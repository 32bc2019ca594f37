#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock HEOS device for testing
//!
//! Simulates the HEOS CLI protocol (line commands in, JSON lines out) with
//! scriptable player state, event injection, per-command delays and failures,
//! and the ability to go silent or drop every connection.

use heos_control::heos::codec::Command;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Per-player state
#[derive(Debug, Clone)]
pub struct MockPlayer {
    pub pid: i64,
    pub name: String,
    pub model: String,
    pub volume: u8,
    pub muted: bool,
    pub state: &'static str,
    pub repeat: &'static str,
    pub shuffle: &'static str,
}

impl MockPlayer {
    pub fn new(pid: i64, name: &str) -> Self {
        Self {
            pid,
            name: name.to_string(),
            model: "HEOS Drive".to_string(),
            volume: 25,
            muted: false,
            state: "stop",
            repeat: "off",
            shuffle: "off",
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "pid": self.pid,
            "model": self.model,
            "version": "1.583.147",
            "ip": "127.0.0.1",
            "network": "wired",
            "lineout": 0,
            "serial": format!("SN{}", self.pid)
        })
    }
}

/// Mock HEOS device state
#[derive(Debug)]
pub struct MockHeosState {
    pub players: Vec<MockPlayer>,
    pub now_playing: Value,
    pub sources: Value,
    /// Every command line received, in order
    pub received: Vec<String>,
    /// Stop answering anything (commands are still recorded)
    pub silent: bool,
    /// Answer `get_players` with an interim "command under process" first
    pub under_process: bool,
    /// Response delay per command kind
    pub delays: HashMap<String, Duration>,
    /// Forced failures per command kind: (eid, text)
    pub failures: HashMap<String, (i32, String)>,
}

impl Default for MockHeosState {
    fn default() -> Self {
        Self {
            players: vec![MockPlayer::new(1, "Living Room"), MockPlayer::new(2, "Kitchen")],
            now_playing: json!({
                "type": "song",
                "song": "Windowlicker",
                "album": "",
                "artist": "Aphex Twin",
                "image_url": "",
                "mid": "1",
                "qid": 1,
                "sid": 1024
            }),
            sources: json!([
                {"name": "TuneIn", "image_url": "", "type": "music_service", "sid": 3, "available": "true"},
                {"name": "AUX Input", "image_url": "", "type": "heos_service", "sid": 1027, "available": "true"}
            ]),
            received: Vec::new(),
            silent: false,
            under_process: false,
            delays: HashMap::new(),
            failures: HashMap::new(),
        }
    }
}

type SharedState = Arc<Mutex<MockHeosState>>;

/// Mock HEOS device
pub struct MockHeosDevice {
    addr: SocketAddr,
    state: SharedState,
    events: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockHeosDevice {
    /// Start a mock HEOS device on a random port
    pub async fn start() -> Self {
        let state: SharedState = Arc::new(Mutex::new(MockHeosState::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = {
            let state = state.clone();
            let events = events.clone();
            let kill = kill.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            connections.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(handle_connection(
                                stream,
                                state.clone(),
                                events.subscribe(),
                                kill.subscribe(),
                                events.clone(),
                            ));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            addr,
            state,
            events,
            kill,
            connections,
            handle,
        }
    }

    /// Get the device address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockHeosState> {
        self.state.lock().unwrap()
    }

    pub fn player(&self, pid: i64) -> MockPlayer {
        self.state()
            .players
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
            .unwrap()
    }

    pub fn set_volume(&self, pid: i64, volume: u8) {
        self.with_player(pid, |p| p.volume = volume);
    }

    pub fn set_muted(&self, pid: i64, muted: bool) {
        self.with_player(pid, |p| p.muted = muted);
    }

    pub fn set_play_state(&self, pid: i64, state: &'static str) {
        self.with_player(pid, |p| p.state = state);
    }

    fn with_player(&self, pid: i64, f: impl FnOnce(&mut MockPlayer)) {
        let mut state = self.state();
        let player = state.players.iter_mut().find(|p| p.pid == pid).unwrap();
        f(player);
    }

    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    pub fn set_under_process(&self, enabled: bool) {
        self.state().under_process = enabled;
    }

    /// Delay responses to `kind` (e.g. `player/get_volume`)
    pub fn set_delay(&self, kind: &str, delay: Duration) {
        self.state().delays.insert(kind.to_string(), delay);
    }

    /// Answer `kind` with `result=fail`
    pub fn fail_command(&self, kind: &str, eid: i32, text: &str) {
        self.state()
            .failures
            .insert(kind.to_string(), (eid, text.to_string()));
    }

    /// All command lines received so far
    pub fn received(&self) -> Vec<String> {
        self.state().received.clone()
    }

    /// Received commands of one kind
    pub fn received_kind(&self, kind: &str) -> Vec<Command> {
        self.received()
            .iter()
            .filter_map(|line| Command::parse(line).ok())
            .filter(|cmd| cmd.kind() == kind)
            .collect()
    }

    /// Push a raw line to every connected client
    pub fn send_raw(&self, line: &str) {
        let _ = self.events.send(line.to_string());
    }

    /// Push a change event to every connected client
    pub fn send_event(&self, event: &str, message: &str) {
        self.send_raw(&event_line(event, message));
    }

    /// Close every open connection (the listener keeps accepting)
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stop the mock device: stop accepting and close every connection
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
        let _ = self.kill.send(());
    }
}

fn event_line(event: &str, message: &str) -> String {
    json!({"heos": {"command": format!("event/{}", event), "message": message}}).to_string()
}

fn response_line(command: &str, result: &str, message: &str, payload: Option<Value>) -> String {
    let mut value = json!({"heos": {"command": command, "result": result, "message": message}});
    if let Some(payload) = payload {
        value["payload"] = payload;
    }
    value.to_string()
}

/// Handle a single TCP connection
async fn handle_connection(
    stream: TcpStream,
    state: SharedState,
    mut events: broadcast::Receiver<String>,
    mut kill: broadcast::Receiver<()>,
    event_tx: broadcast::Sender<String>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            _ = kill.recv() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let replies = {
                    let mut state = state.lock().unwrap();
                    state.received.push(line.trim().to_string());
                    if state.silent {
                        None
                    } else {
                        Some(process_command(line.trim(), &mut state))
                    }
                };
                let Some((delay, replies, changes)) = replies else { continue };
                for event in changes {
                    let _ = event_tx.send(event);
                }
                let out = out_tx.clone();
                if delay.is_zero() {
                    for reply in replies {
                        let _ = out.send(reply);
                    }
                } else {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        for reply in replies {
                            let _ = out.send(reply);
                        }
                    });
                }
            }
            Some(reply) = out_rx.recv() => {
                if writer.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(event) = events.recv() => {
                if writer.write_all(format!("{}\r\n", event).as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Returns (delay, response lines, change events to broadcast)
fn process_command(line: &str, state: &mut MockHeosState) -> (Duration, Vec<String>, Vec<String>) {
    let cmd = match Command::parse(line) {
        Ok(cmd) => cmd,
        Err(_) => return (Duration::ZERO, vec![], vec![]),
    };
    let kind = cmd.kind();
    let delay = state.delays.get(&kind).copied().unwrap_or_default();

    if let Some((eid, text)) = state.failures.get(&kind) {
        let message = format!("eid={}&text={}", eid, text);
        return (delay, vec![response_line(&kind, "fail", &message, None)], vec![]);
    }

    let ok = |message: String| vec![response_line(&kind, "success", &message, None)];
    let mut events = Vec::new();

    let pid = cmd.get("pid").and_then(|p| p.parse::<i64>().ok());
    let needs_player = (kind.starts_with("player/") && kind != "player/get_players")
        || matches!(kind.as_str(), "browse/play_input" | "browse/play_preset" | "browse/play_stream");
    let player_index = pid.and_then(|pid| state.players.iter().position(|p| p.pid == pid));
    if needs_player && player_index.is_none() {
        let message = format!("eid=2&text=ID Not Valid&pid={}", pid.unwrap_or(-1));
        return (delay, vec![response_line(&kind, "fail", &message, None)], vec![]);
    }
    let pid = pid.unwrap_or_default();

    let replies = match kind.as_str() {
        "system/register_for_change_events" => ok(format!(
            "enable={}",
            cmd.get("enable").unwrap_or("off")
        )),
        "system/heart_beat" => ok(String::new()),
        "player/get_players" => {
            let players: Vec<Value> = state.players.iter().map(MockPlayer::to_json).collect();
            let mut replies = Vec::new();
            if state.under_process {
                replies.push(response_line(&kind, "success", "command under process", None));
            }
            replies.push(response_line(&kind, "success", "", Some(Value::Array(players))));
            replies
        }
        "player/get_player_info" => {
            let player = state.players[player_index.unwrap()].to_json();
            vec![response_line(&kind, "success", &format!("pid={}", pid), Some(player))]
        }
        _ => {
            let idx = player_index.unwrap_or_default();
            let player = state.players.get_mut(idx);
            match (kind.as_str(), player) {
                ("player/get_play_state", Some(p)) => ok(format!("pid={}&state={}", pid, p.state)),
                ("player/set_play_state", Some(p)) => {
                    let requested = cmd.get("state").unwrap_or("stop");
                    p.state = match requested {
                        "play" => "play",
                        "pause" => "pause",
                        _ => "stop",
                    };
                    events.push(event_line(
                        "player_state_changed",
                        &format!("pid={}&state={}", pid, p.state),
                    ));
                    ok(format!("pid={}&state={}", pid, p.state))
                }
                ("player/get_volume", Some(p)) => ok(format!("pid={}&level={}", pid, p.volume)),
                ("player/set_volume", Some(p)) => {
                    p.volume = cmd.get("level").and_then(|l| l.parse().ok()).unwrap_or(p.volume);
                    events.push(volume_event(p));
                    ok(format!("pid={}&level={}", pid, p.volume))
                }
                ("player/volume_up", Some(p)) => {
                    let step: u8 = cmd.get("step").and_then(|s| s.parse().ok()).unwrap_or(5);
                    p.volume = p.volume.saturating_add(step).min(100);
                    events.push(volume_event(p));
                    ok(format!("pid={}&step={}", pid, step))
                }
                ("player/volume_down", Some(p)) => {
                    let step: u8 = cmd.get("step").and_then(|s| s.parse().ok()).unwrap_or(5);
                    p.volume = p.volume.saturating_sub(step);
                    events.push(volume_event(p));
                    ok(format!("pid={}&step={}", pid, step))
                }
                ("player/get_mute", Some(p)) => ok(format!("pid={}&state={}", pid, on_off(p.muted))),
                ("player/set_mute", Some(p)) => {
                    p.muted = cmd.get("state") == Some("on");
                    events.push(volume_event(p));
                    ok(format!("pid={}&state={}", pid, on_off(p.muted)))
                }
                ("player/toggle_mute", Some(p)) => {
                    p.muted = !p.muted;
                    events.push(volume_event(p));
                    ok(format!("pid={}", pid))
                }
                ("player/get_play_mode", Some(p)) => ok(format!(
                    "pid={}&repeat={}&shuffle={}",
                    pid, p.repeat, p.shuffle
                )),
                ("player/set_play_mode", Some(p)) => {
                    if let Some(repeat) = cmd.get("repeat") {
                        p.repeat = match repeat {
                            "on_one" => "on_one",
                            "on_all" => "on_all",
                            _ => "off",
                        };
                    }
                    if let Some(shuffle) = cmd.get("shuffle") {
                        p.shuffle = if shuffle == "on" { "on" } else { "off" };
                    }
                    ok(format!("pid={}&repeat={}&shuffle={}", pid, p.repeat, p.shuffle))
                }
                ("player/get_now_playing_media", Some(_)) => vec![response_line(
                    &kind,
                    "success",
                    &format!("pid={}", pid),
                    Some(state.now_playing.clone()),
                )],
                ("player/play_next", Some(_))
                | ("player/play_previous", Some(_))
                | ("player/clear_queue", Some(_)) => ok(format!("pid={}", pid)),
                ("browse/get_music_sources", _) => vec![response_line(
                    &kind,
                    "success",
                    "",
                    Some(state.sources.clone()),
                )],
                ("browse/play_input", Some(_)) => ok(format!(
                    "pid={}&input={}",
                    pid,
                    cmd.get("input").unwrap_or_default()
                )),
                ("browse/play_preset", Some(_)) => ok(format!(
                    "pid={}&preset={}",
                    pid,
                    cmd.get("preset").unwrap_or_default()
                )),
                ("browse/play_stream", Some(_)) => ok(format!("pid={}", pid)),
                _ => vec![response_line(
                    &kind,
                    "fail",
                    "eid=1&text=Unrecognized Command",
                    None,
                )],
            }
        }
    };

    (delay, replies, events)
}

fn volume_event(player: &MockPlayer) -> String {
    event_line(
        "player_volume_changed",
        &format!(
            "pid={}&level={}&mute={}",
            player.pid,
            player.volume,
            on_off(player.muted)
        ),
    )
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

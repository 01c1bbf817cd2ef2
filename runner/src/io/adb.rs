//! Android device bridge over the `adb` command line.
//!
//! Snapshots come from `uiautomator dump`; actions are `input` shell calls.
//! Every adb invocation is a child process bounded by the request timeout.

use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::action::{ActionProposal, Locator, ScrollDirection};
use crate::core::budget::remaining_budget;
use crate::core::classifier::{ScreenRule, UNKNOWN_SCREEN, classify};
use crate::core::types::{Bounds, ExecutionOutcome, Role, ScreenSnapshot, StepFailure, UiElement};
use crate::io::config::DeviceConfig;
use crate::io::device::{DeviceError, DeviceExecutor, DeviceRequest, SnapshotProvider};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Elements this small (either dimension, px) are dropped from snapshots.
pub const MIN_ELEMENT_PX: i32 = 10;

const DUMP_PATH: &str = "/sdcard/window_dump.xml";
const KEY_ENTER: &str = "66";
const KEY_BACK: &str = "4";
const KEY_MOVE_END: &str = "123";
const KEY_DEL: &str = "67";
/// Deletes issued by `clear-and-enter-text`.
const CLEAR_DELETES: usize = 50;
const DEFAULT_SCREEN: (i32, i32) = (1080, 2400);
const SWIPE_MS: &str = "300";

static NODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<node\b([^>]*?)/?>").expect("node regex"));
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w:-]+)="([^"]*)""#).expect("attr regex"));
static BOUNDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]$").expect("bounds regex")
});
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)x(\d+)").expect("size regex"));

/// Parse a uiautomator hierarchy dump into visible elements.
///
/// A node is kept when it has text, a content description, or is clickable or
/// focusable, and both of its dimensions exceed [`MIN_ELEMENT_PX`]. Output is
/// in document order, which uiautomator emits top to bottom.
pub fn parse_ui_dump(xml: &str) -> Vec<UiElement> {
    let mut elements = Vec::new();
    for node in NODE_RE.captures_iter(xml) {
        let mut text = String::new();
        let mut desc = String::new();
        let mut class = String::new();
        let mut bounds = None;
        let mut clickable = false;
        let mut focusable = false;
        for attr in ATTR_RE.captures_iter(&node[1]) {
            let value = &attr[2];
            match &attr[1] {
                "text" => text = unescape_xml(value),
                "content-desc" => desc = unescape_xml(value),
                "class" => class = value.to_string(),
                "clickable" => clickable = value == "true",
                "focusable" => focusable = value == "true",
                "bounds" => bounds = parse_bounds(value),
                _ => {}
            }
        }
        let Some(bounds) = bounds else {
            continue;
        };
        if bounds.width() <= MIN_ELEMENT_PX || bounds.height() <= MIN_ELEMENT_PX {
            continue;
        }
        let label = if text.trim().is_empty() { desc } else { text };
        if label.trim().is_empty() && !clickable && !focusable {
            continue;
        }
        elements.push(UiElement {
            text: label.trim().to_string(),
            role: Role::from_class(&class),
            bounds,
            clickable,
        });
    }
    elements
}

fn parse_bounds(raw: &str) -> Option<Bounds> {
    let caps = BOUNDS_RE.captures(raw.trim())?;
    let num = |i: usize| caps[i].parse::<i32>().ok();
    Some(Bounds::new(num(1)?, num(2)?, num(3)?, num(4)?))
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

/// Escape text for `adb shell input text`: spaces become `%s` and shell
/// metacharacters are backslash-escaped.
pub fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("%s"),
            '\'' | '"' | '&' | '|' | ';' | '(' | ')' | '<' | '>' | '$' | '`' | '\\' | '*'
            | '~' | '?' | '#' | '%' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Start and end points of a swipe that scrolls content in `direction`.
pub fn swipe_path(direction: ScrollDirection, (width, height): (i32, i32)) -> [i32; 4] {
    let (cx, cy) = (width / 2, height / 2);
    let (near_y, far_y) = (height * 3 / 4, height / 4);
    let (near_x, far_x) = (width * 4 / 5, width / 5);
    match direction {
        ScrollDirection::Down => [cx, near_y, cx, far_y],
        ScrollDirection::Up => [cx, far_y, cx, near_y],
        ScrollDirection::Right => [near_x, cy, far_x, cy],
        ScrollDirection::Left => [far_x, cy, near_x, cy],
    }
}

/// A device reached through `adb`.
pub struct AdbDevice {
    config: DeviceConfig,
    screens: Vec<ScreenRule>,
    screen_size: Option<(i32, i32)>,
}

impl AdbDevice {
    pub fn new(config: DeviceConfig, screens: Vec<ScreenRule>) -> Self {
        Self {
            config,
            screens,
            screen_size: None,
        }
    }

    /// Reset `package` to a fresh install state and launch it.
    #[instrument(skip(self))]
    pub fn prepare_app(&mut self, package: &str, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        self.shell(&["pm", "clear", package], deadline)?;
        self.shell(
            &[
                "monkey",
                "-p",
                package,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
            deadline,
        )?;
        info!(package, "app reset and launched");
        self.settle_for(Duration::from_secs(2));
        Ok(())
    }

    fn adb(&self, args: &[&str], deadline: Instant) -> Result<CommandOutput, DeviceError> {
        let timeout = remaining_budget(deadline)
            .ok_or(DeviceError::Timeout(Duration::ZERO))?;
        let mut cmd = Command::new(&self.config.adb_path);
        if let Some(serial) = &self.config.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        let output = run_command_with_timeout(cmd, None, timeout, self.config.output_limit_bytes)
            .map_err(|err| DeviceError::Unavailable(format!("{:#}", err)))?;
        if output.timed_out {
            return Err(DeviceError::Timeout(timeout));
        }
        if !output.status.success() {
            return Err(DeviceError::Io(format!(
                "adb {} exited with {:?}: {}",
                args.join(" "),
                output.status.code(),
                output.diagnostic()
            )));
        }
        Ok(output)
    }

    fn shell(&self, args: &[&str], deadline: Instant) -> Result<CommandOutput, DeviceError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);
        self.adb(&full, deadline)
    }

    fn tap(&self, (x, y): (i32, i32), deadline: Instant) -> Result<String, DeviceError> {
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()], deadline)?;
        Ok(format!("tapped ({x},{y})"))
    }

    fn keyevent(&self, codes: &[&str], deadline: Instant) -> Result<(), DeviceError> {
        let mut args = vec!["input", "keyevent"];
        args.extend_from_slice(codes);
        self.shell(&args, deadline)?;
        Ok(())
    }

    fn type_text(&self, text: &str, deadline: Instant) -> Result<String, DeviceError> {
        let escaped = escape_input_text(text);
        self.shell(&["input", "text", &escaped], deadline)?;
        Ok(format!("typed '{text}'"))
    }

    fn size(&mut self, deadline: Instant) -> (i32, i32) {
        if let Some(size) = self.screen_size {
            return size;
        }
        let size = match self.shell(&["wm", "size"], deadline) {
            Ok(output) => {
                let stdout = output.stdout_lossy();
                // "Override size" follows "Physical size" when present.
                SIZE_RE
                    .captures_iter(&stdout)
                    .last()
                    .and_then(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
                    .unwrap_or(DEFAULT_SCREEN)
            }
            Err(err) => {
                warn!(err = %err, "wm size failed; assuming default screen size");
                DEFAULT_SCREEN
            }
        };
        self.screen_size = Some(size);
        size
    }

    fn settle_for(&self, pause: Duration) {
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    fn dispatch(
        &mut self,
        request: &DeviceRequest<'_>,
        deadline: Instant,
    ) -> Result<Result<String, String>, DeviceError> {
        let message = match request.action {
            ActionProposal::FocusInput {
                target: Locator::Point { x, y },
            }
            | ActionProposal::TapByCoordinate { x, y } => self.tap((*x, *y), deadline)?,
            ActionProposal::FocusInput {
                target: Locator::Label { .. },
            }
            | ActionProposal::TapByTarget { .. } => match request.element {
                Some(element) => self.tap(element.center(), deadline)?,
                None => return Ok(Err("no element resolved for target".to_string())),
            },
            ActionProposal::EnterText { text } => self.type_text(text, deadline)?,
            ActionProposal::ClearAndEnterText { text } => {
                self.keyevent(&[KEY_MOVE_END], deadline)?;
                self.keyevent(&[KEY_DEL; CLEAR_DELETES], deadline)?;
                self.type_text(text, deadline)?
            }
            ActionProposal::Confirm => {
                self.keyevent(&[KEY_ENTER], deadline)?;
                "pressed enter".to_string()
            }
            ActionProposal::NavigateBack => {
                self.keyevent(&[KEY_BACK], deadline)?;
                "pressed back".to_string()
            }
            ActionProposal::Scroll { direction } => {
                let [x1, y1, x2, y2] = swipe_path(*direction, self.size(deadline));
                let coords = [x1, y1, x2, y2].map(|v| v.to_string());
                self.shell(
                    &[
                        "input", "swipe", &coords[0], &coords[1], &coords[2], &coords[3], SWIPE_MS,
                    ],
                    deadline,
                )?;
                format!("scrolled {}", direction.as_str())
            }
            ActionProposal::Wait { seconds } => {
                let wanted = Duration::from_secs_f64(*seconds);
                let budget = remaining_budget(deadline).unwrap_or_default();
                thread::sleep(wanted.min(budget));
                format!("waited {seconds}s")
            }
            ActionProposal::DeclareDone { .. } | ActionProposal::DeclareFailed { .. } => {
                return Ok(Err("declarations are not device actions".to_string()));
            }
        };
        Ok(Ok(message))
    }
}

impl SnapshotProvider for AdbDevice {
    #[instrument(skip(self), fields(serial = ?self.config.serial))]
    fn capture(&mut self, timeout: Duration) -> Result<ScreenSnapshot, DeviceError> {
        let deadline = Instant::now() + timeout;
        self.shell(&["uiautomator", "dump", DUMP_PATH], deadline)?;
        let output = self.shell(&["cat", DUMP_PATH], deadline)?;
        let xml = output.stdout_lossy();
        if !xml.contains("<hierarchy") {
            return Err(DeviceError::Io("ui dump is empty or truncated".to_string()));
        }
        let mut snapshot = ScreenSnapshot::new(parse_ui_dump(&xml), UNKNOWN_SCREEN);
        snapshot.screen_type = classify(&self.screens, &snapshot);
        debug!(
            elements = snapshot.elements.len(),
            screen_type = %snapshot.screen_type,
            "captured snapshot"
        );
        Ok(snapshot)
    }
}

impl DeviceExecutor for AdbDevice {
    #[instrument(skip_all, fields(kind = %request.action.kind()))]
    fn execute(&mut self, request: &DeviceRequest<'_>) -> Result<ExecutionOutcome, DeviceError> {
        let started_at = Utc::now();
        let deadline = Instant::now() + request.timeout;
        let outcome = match self.dispatch(request, deadline)? {
            Ok(message) => ExecutionOutcome::succeeded(message, started_at),
            Err(message) => ExecutionOutcome::failed(message, started_at, StepFailure::Rejected),
        };
        self.settle_for(Duration::from_millis(self.config.settle_ms));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation="0"><node index="0" text="" resource-id="" class="android.widget.FrameLayout" content-desc="" clickable="false" focusable="false" bounds="[0,0][1080,2400]"><node index="1" text="Confirm access" class="android.widget.TextView" content-desc="" clickable="false" focusable="false" bounds="[100,320][980,394]" /><node index="2" text="" class="android.widget.ImageButton" content-desc="Settings &amp; sync" clickable="true" focusable="true" bounds="[960,120][1060,220]" /><node index="3" text="Confirm access" class="android.widget.Button" content-desc="" clickable="true" focusable="true" bounds="[100,1960][980,2072]" /><node index="4" text="tiny" class="android.widget.TextView" clickable="false" bounds="[0,0][5,5]" /><node index="5" text="" class="android.widget.EditText" clickable="true" focusable="true" bounds="[40,600][1040,700]" /></node></hierarchy>UI hierchary dumped to: /dev/tty"#;

    #[test]
    fn parses_visible_nodes_in_document_order() {
        let elements = parse_ui_dump(DUMP);
        let texts: Vec<_> = elements.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Confirm access", "Settings & sync", "Confirm access", ""]);
        assert_eq!(elements[0].role, Role::Text);
        assert_eq!(elements[1].role, Role::Button);
        assert_eq!(elements[2].center(), (540, 2016));
        assert!(elements[2].clickable);
        assert_eq!(elements[3].role, Role::Input);
    }

    #[test]
    fn drops_elements_at_or_below_minimum_size() {
        let elements = parse_ui_dump(DUMP);
        assert!(elements.iter().all(|e| e.text != "tiny"));
    }

    #[test]
    fn escapes_input_text() {
        assert_eq!(escape_input_text("Meeting Notes"), "Meeting%sNotes");
        assert_eq!(escape_input_text("a&b (c)"), "a\\&b%s\\(c\\)");
        assert_eq!(escape_input_text("it's"), "it\\'s");
    }

    #[test]
    fn swipe_down_moves_finger_up() {
        let [_, y1, _, y2] = swipe_path(ScrollDirection::Down, (1080, 2400));
        assert!(y1 > y2);
        let [x1, _, x2, _] = swipe_path(ScrollDirection::Right, (1080, 2400));
        assert!(x1 > x2);
    }

    #[test]
    fn rejects_malformed_bounds() {
        assert_eq!(parse_bounds("[0,0][10"), None);
        assert_eq!(parse_bounds("[1,2][3,4]"), Some(Bounds::new(1, 2, 3, 4)));
    }

    #[cfg(unix)]
    #[test]
    fn missing_adb_binary_is_unavailable() {
        let config = DeviceConfig {
            adb_path: "/nonexistent/adb".to_string(),
            ..DeviceConfig::default()
        };
        let mut device = AdbDevice::new(config, Vec::new());
        let err = device.capture(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
        assert!(!err.is_transient());
    }
}

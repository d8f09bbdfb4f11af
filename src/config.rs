//! Command-line parsing and the per-output config resolver.
//!
//! Flags form an ordered program (`-o`/`-w` select, the rest assign), so
//! the clap-parsed values are re-interleaved by argument index into a
//! single option stream. The resolver compiles that stream, per output,
//! into an ordered config list plus the active config.

use std::path::PathBuf;
use std::rc::Rc;

use clap::{ArgAction, ArgMatches, Parser};

use crate::buffer::Buffer;
use crate::image::{Image, ImageId};
use crate::types::{parse_position, BackgroundMode, Color, SizeQ16};

#[derive(Parser)]
#[command(name = "wsbg")]
#[command(about = "Per-workspace wallpaper daemon for Wayland compositors")]
#[command(version)]
pub struct Cli {
    /// Background color (rrggbb or #rrggbb)
    #[arg(short, long, action = ArgAction::Append)]
    pub color: Vec<String>,

    /// Image to display
    #[arg(short, long, action = ArgAction::Append)]
    pub image: Vec<PathBuf>,

    /// Mode to use for the image: stretch, fit, fill, center, tile, or solid_color
    #[arg(short, long, action = ArgAction::Append)]
    pub mode: Vec<String>,

    /// Output to operate on, or * for all
    #[arg(short, long, action = ArgAction::Append)]
    pub output: Vec<String>,

    /// Position of the image: center, left, right, top, bottom, or e.g. top/left
    #[arg(short, long, action = ArgAction::Append)]
    pub position: Vec<String>,

    /// Workspace to operate on, or * for all
    #[arg(short, long, action = ArgAction::Append)]
    pub workspace: Vec<String>,
}

/// One entry of the option stream. Selector values of `None` mean `*`.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Output(Option<String>),
    Workspace(Option<String>),
    Color(Color),
    Image(ImageId),
    Mode(BackgroundMode),
    Position(SizeQ16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKind {
    Output,
    Workspace,
    Color,
    Image,
    Mode,
    Position,
}

impl OptionValue {
    fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Output(_) => OptionKind::Output,
            OptionValue::Workspace(_) => OptionKind::Workspace,
            OptionValue::Color(_) => OptionKind::Color,
            OptionValue::Image(_) => OptionKind::Image,
            OptionValue::Mode(_) => OptionKind::Mode,
            OptionValue::Position(_) => OptionKind::Position,
        }
    }

    fn is_selector(&self) -> bool {
        matches!(self, OptionValue::Output(_) | OptionValue::Workspace(_))
    }
}

/// The parsed option stream plus the image table it references.
pub struct Options {
    pub stream: Vec<OptionValue>,
    pub images: Vec<Image>,
}

impl Options {
    /// Rebuild the left-to-right flag order from argument indices.
    pub fn from_matches(matches: &ArgMatches) -> Options {
        let mut raw: Vec<(usize, OptionKind, String)> = Vec::new();
        let mut collect = |id: &str, kind: OptionKind| {
            let indices = match matches.indices_of(id) {
                Some(indices) => indices,
                None => return,
            };
            if kind == OptionKind::Image {
                let values = matches.get_many::<PathBuf>(id).into_iter().flatten();
                for (index, value) in indices.zip(values) {
                    raw.push((index, kind, value.to_string_lossy().into_owned()));
                }
            } else {
                let values = matches.get_many::<String>(id).into_iter().flatten();
                for (index, value) in indices.zip(values) {
                    raw.push((index, kind, value.clone()));
                }
            }
        };
        collect("color", OptionKind::Color);
        collect("image", OptionKind::Image);
        collect("mode", OptionKind::Mode);
        collect("output", OptionKind::Output);
        collect("position", OptionKind::Position);
        collect("workspace", OptionKind::Workspace);
        raw.sort_by_key(|(index, _, _)| *index);

        let mut options = Options {
            stream: Vec::new(),
            images: Vec::new(),
        };
        for (_, kind, value) in raw {
            match kind {
                OptionKind::Output => options.push_selector(OptionValue::Output(selector(value))),
                OptionKind::Workspace => {
                    options.push_selector(OptionValue::Workspace(selector(value)))
                }
                OptionKind::Color => match Color::parse(&value) {
                    Some(color) => options.push_value(OptionValue::Color(color)),
                    None => log::error!(
                        "Invalid color: {value} (color should be specified as rrggbb or #rrggbb)"
                    ),
                },
                OptionKind::Image => {
                    let id = options.intern_image(PathBuf::from(value));
                    options.push_value(OptionValue::Image(id));
                }
                OptionKind::Mode => match BackgroundMode::parse(&value) {
                    Some((mode, position)) => {
                        options.push_value(OptionValue::Mode(mode));
                        options.push_value(OptionValue::Position(position));
                    }
                    None => log::error!("Invalid mode: {value}"),
                },
                OptionKind::Position => match parse_position(&value) {
                    Some(position) => options.push_value(OptionValue::Position(position)),
                    None => log::error!("Invalid position: {value}"),
                },
            }
        }
        options
    }

    fn intern_image(&mut self, path: PathBuf) -> ImageId {
        if let Some(index) = self.images.iter().position(|image| image.path() == path) {
            return ImageId(index);
        }
        self.images.push(Image::new(path));
        ImageId(self.images.len() - 1)
    }

    fn push_selector(&mut self, value: OptionValue) {
        self.stream.push(value);
    }

    /// Value options overwrite an earlier option of the same kind within
    /// the current selector group instead of appending.
    fn push_value(&mut self, value: OptionValue) {
        for existing in self.stream.iter_mut().rev() {
            if existing.is_selector() {
                break;
            }
            if existing.kind() == value.kind() {
                *existing = value;
                return;
            }
        }
        self.stream.push(value);
    }
}

fn selector(value: String) -> Option<String> {
    if value == "*" {
        None
    } else {
        Some(value)
    }
}

/// Resolved draw parameters for one (output, workspace) pair. The config
/// owns one reference to its last rendered buffer.
#[derive(Clone)]
pub struct Config {
    pub workspace: Option<String>,
    pub color: Color,
    pub image: Option<ImageId>,
    pub mode: BackgroundMode,
    pub position: SizeQ16,
    pub buffer: Option<Rc<Buffer>>,
}

impl Config {
    pub fn new_default() -> Config {
        Config {
            workspace: None,
            color: Color::BLACK,
            image: None,
            mode: BackgroundMode::Fill,
            position: SizeQ16::CENTER,
            buffer: None,
        }
    }
}

/// Compile the option stream for one output. Returns the ordered config
/// list and the index of the active config (the one whose workspace is
/// currently visible, else the default).
pub fn resolve_configs(
    stream: &[OptionValue],
    name: &str,
    identifier: &str,
    visible_workspace: Option<&str>,
) -> (Vec<Config>, usize) {
    let mut committed: Vec<Config> = Vec::new();
    let mut staging: Vec<Config> = vec![Config::new_default()];
    let mut selected = true;
    let mut prev_kind: Option<OptionKind> = None;

    for option in stream {
        match option {
            OptionValue::Output(sel) => {
                let matched = sel
                    .as_deref()
                    .map_or(true, |sel| sel == name || sel == identifier);
                selected = (selected && prev_kind == Some(OptionKind::Output)) || matched;
            }
            OptionValue::Workspace(None) => {
                // `-w *` reopens every committed config for assignment.
                let reopened: Vec<Config> = committed.drain(..).collect();
                staging.splice(0..0, reopened);
            }
            OptionValue::Workspace(Some(workspace)) => {
                let mut staged = false;
                if prev_kind == Some(OptionKind::Workspace) {
                    staged = staging
                        .iter()
                        .any(|config| config.workspace.as_deref() == Some(workspace.as_str()));
                } else {
                    let closed: Vec<Config> = staging.drain(..).collect();
                    committed.splice(0..0, closed);
                }
                if !staged {
                    let config = match committed
                        .iter()
                        .position(|config| config.workspace.as_deref() == Some(workspace.as_str()))
                    {
                        Some(index) => committed.remove(index),
                        None => {
                            let mut config = staging
                                .iter()
                                .chain(committed.iter())
                                .find(|config| config.workspace.is_none())
                                .cloned()
                                .unwrap_or_else(Config::new_default);
                            config.workspace = Some(workspace.clone());
                            config
                        }
                    };
                    staging.insert(0, config);
                }
            }
            value if selected => {
                for config in &mut staging {
                    match value {
                        OptionValue::Color(color) => config.color = *color,
                        OptionValue::Image(id) => config.image = Some(*id),
                        OptionValue::Mode(mode) => config.mode = *mode,
                        OptionValue::Position(position) => config.position = *position,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        prev_kind = Some(option.kind());
    }

    let staged: Vec<Config> = staging.drain(..).collect();
    committed.splice(0..0, staged);

    let active = active_config(&committed, visible_workspace);
    (committed, active)
}

fn active_config(configs: &[Config], visible_workspace: Option<&str>) -> usize {
    visible_workspace
        .and_then(|workspace| {
            configs
                .iter()
                .position(|config| config.workspace.as_deref() == Some(workspace))
        })
        .or_else(|| configs.iter().position(|config| config.workspace.is_none()))
        .unwrap_or(0)
}

/// Move the active config after `workspace` became visible on the
/// output owning `configs`. Returns the new active index and whether it
/// actually moved.
pub fn activate_workspace(configs: &[Config], active: usize, workspace: &str) -> (usize, bool) {
    if configs
        .get(active)
        .map_or(false, |config| config.workspace.as_deref() == Some(workspace))
    {
        return (active, false);
    }

    let mut new_active = active;
    let mut changed = false;
    for (index, config) in configs.iter().enumerate() {
        match config.workspace.as_deref() {
            None => {
                changed = changed || new_active != index;
                new_active = index;
            }
            Some(name) if name == workspace => {
                return (index, true);
            }
            _ => {}
        }
    }
    (new_active, changed)
}

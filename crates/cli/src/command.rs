//! Line-oriented command grammar read from stdin.
//!
//! ```text
//! load <frame>            label <uuid>
//! click <x> <y> [exclude] remove <label> <point>
//! pan <dx> <dy>           zoom in|out <x> <y>
//! resize <w> <h>          fit
//! clear <label>           clear-all
//! snapshot                quit
//! ```

use segmark_core::types::{FrameNumber, LabelId, PointId};
use segmark_core::viewport::{Size, Vec2, ZoomDirection};
use segmark_session::SessionCommand;

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Load(FrameNumber),
    Label(LabelId),
    Click { x: f64, y: f64, include: bool },
    Remove { label_id: LabelId, point_id: PointId },
    Pan { dx: f64, dy: f64 },
    Zoom { direction: ZoomDirection, x: f64, y: f64 },
    Resize { w: f64, h: f64 },
    Fit,
    Clear(LabelId),
    ClearAll,
    Snapshot,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid {what}: {value}")]
    Invalid { what: &'static str, value: String },
}

impl CliCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            return Err(ParseError::Empty);
        };

        match (name, args) {
            ("load", [frame]) => Ok(Self::Load(parse_num(frame, "frame number")?)),
            ("load", _) => Err(ParseError::Usage("load <frame>")),

            ("label", [id]) => Ok(Self::Label(parse_uuid(id, "label id")?)),
            ("label", _) => Err(ParseError::Usage("label <uuid>")),

            ("click", [x, y, rest @ ..]) if rest.len() <= 1 => {
                let include = match rest {
                    [] | ["include"] => true,
                    ["exclude"] => false,
                    _ => return Err(ParseError::Usage("click <x> <y> [include|exclude]")),
                };
                Ok(Self::Click {
                    x: parse_num(x, "x")?,
                    y: parse_num(y, "y")?,
                    include,
                })
            }
            ("click", _) => Err(ParseError::Usage("click <x> <y> [include|exclude]")),

            ("remove", [label, point]) => Ok(Self::Remove {
                label_id: parse_uuid(label, "label id")?,
                point_id: parse_uuid(point, "point id")?,
            }),
            ("remove", _) => Err(ParseError::Usage("remove <label> <point>")),

            ("pan", [dx, dy]) => Ok(Self::Pan {
                dx: parse_num(dx, "dx")?,
                dy: parse_num(dy, "dy")?,
            }),
            ("pan", _) => Err(ParseError::Usage("pan <dx> <dy>")),

            ("zoom", [dir, x, y]) => {
                let direction = match *dir {
                    "in" => ZoomDirection::In,
                    "out" => ZoomDirection::Out,
                    other => {
                        return Err(ParseError::Invalid {
                            what: "zoom direction",
                            value: other.to_string(),
                        })
                    }
                };
                Ok(Self::Zoom {
                    direction,
                    x: parse_num(x, "x")?,
                    y: parse_num(y, "y")?,
                })
            }
            ("zoom", _) => Err(ParseError::Usage("zoom in|out <x> <y>")),

            ("resize", [w, h]) => Ok(Self::Resize {
                w: parse_num(w, "width")?,
                h: parse_num(h, "height")?,
            }),
            ("resize", _) => Err(ParseError::Usage("resize <w> <h>")),

            ("fit", []) => Ok(Self::Fit),
            ("clear", [label]) => Ok(Self::Clear(parse_uuid(label, "label id")?)),
            ("clear", _) => Err(ParseError::Usage("clear <label>")),
            ("clear-all", []) => Ok(Self::ClearAll),
            ("snapshot", []) => Ok(Self::Snapshot),
            ("quit" | "exit", []) => Ok(Self::Quit),

            (other, _) => Err(ParseError::Unknown(other.to_string())),
        }
    }

    /// The session command this maps to. `Snapshot` and `Quit` are
    /// driven through the handle instead and return `None`.
    pub fn into_session_command(self) -> Option<SessionCommand> {
        let command = match self {
            Self::Load(frame_number) => SessionCommand::LoadFrame(frame_number),
            Self::Label(label_id) => SessionCommand::SelectLabel(label_id),
            Self::Click { x, y, include } => SessionCommand::Click {
                canvas_pos: Vec2::new(x, y),
                include,
            },
            Self::Remove { label_id, point_id } => {
                SessionCommand::RemovePoint { label_id, point_id }
            }
            Self::Pan { dx, dy } => SessionCommand::Pan { dx, dy },
            Self::Zoom { direction, x, y } => SessionCommand::Zoom {
                pointer: Vec2::new(x, y),
                direction,
            },
            Self::Resize { w, h } => SessionCommand::Resize(Size::new(w, h)),
            Self::Fit => SessionCommand::FitToView,
            Self::Clear(label_id) => SessionCommand::ClearLabel(label_id),
            Self::ClearAll => SessionCommand::ClearAll,
            Self::Snapshot | Self::Quit => return None,
        };
        Some(command)
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, what: &'static str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::Invalid {
        what,
        value: value.to_string(),
    })
}

fn parse_uuid(value: &str, what: &'static str) -> Result<uuid::Uuid, ParseError> {
    uuid::Uuid::parse_str(value).map_err(|_| ParseError::Invalid {
        what,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn click_defaults_to_include() {
        assert_eq!(
            CliCommand::parse("click 10 20.5"),
            Ok(CliCommand::Click { x: 10.0, y: 20.5, include: true })
        );
        assert_eq!(
            CliCommand::parse("  click 1 2 exclude "),
            Ok(CliCommand::Click { x: 1.0, y: 2.0, include: false })
        );
    }

    #[test]
    fn click_rejects_bad_flag() {
        assert_matches!(CliCommand::parse("click 1 2 maybe"), Err(ParseError::Usage(_)));
        assert_matches!(CliCommand::parse("click 1 2 exclude extra"), Err(ParseError::Usage(_)));
    }

    #[test]
    fn zoom_direction() {
        assert_eq!(
            CliCommand::parse("zoom out 5 6"),
            Ok(CliCommand::Zoom { direction: ZoomDirection::Out, x: 5.0, y: 6.0 })
        );
        assert_matches!(
            CliCommand::parse("zoom sideways 5 6"),
            Err(ParseError::Invalid { what: "zoom direction", .. })
        );
    }

    #[test]
    fn label_requires_uuid() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(CliCommand::parse(&format!("label {id}")), Ok(CliCommand::Label(id)));
        assert_matches!(
            CliCommand::parse("label person"),
            Err(ParseError::Invalid { what: "label id", .. })
        );
    }

    #[test]
    fn negative_frame_is_invalid() {
        assert_matches!(CliCommand::parse("load -1"), Err(ParseError::Invalid { .. }));
    }

    #[test]
    fn empty_and_unknown() {
        assert_eq!(CliCommand::parse("   "), Err(ParseError::Empty));
        assert_eq!(CliCommand::parse("paint"), Err(ParseError::Unknown("paint".into())));
    }

    #[test]
    fn snapshot_and_quit_have_no_session_command() {
        assert!(CliCommand::Snapshot.into_session_command().is_none());
        assert!(CliCommand::Quit.into_session_command().is_none());
        assert_matches!(
            CliCommand::Resize { w: 3.0, h: 4.0 }.into_session_command(),
            Some(SessionCommand::Resize(size)) if size == Size::new(3.0, 4.0)
        );
    }
}

//! URL template expansion for tile resources.
//!
//! Templates carry `{lod}`, `{x}`, `{y}` placeholders for the global tile
//! id, `{loclod}`, `{locx}`, `{locy}` for the id local to the surface's
//! subtree and `{sub}` for a submesh index. Templates are split once at
//! construction so per-tile expansion is a handful of integer formats.

use std::fmt;

use crate::tile::TileId;

/// Variables available to a template expansion.
#[derive(Clone, Copy, Debug, Default)]
pub struct UrlVars {
    pub tile: TileId,
    /// Tile id local to the surface subtree; equals `tile` when the
    /// surface is rooted at the reference-frame root.
    pub local: TileId,
    pub sub: u32,
}

impl UrlVars {
    pub fn tile(tile: TileId) -> Self {
        Self {
            tile,
            local: tile,
            sub: 0,
        }
    }

    pub fn with_sub(tile: TileId, sub: u32) -> Self {
        Self {
            tile,
            local: tile,
            sub,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Lod,
    X,
    Y,
    LocalLod,
    LocalX,
    LocalY,
    Sub,
}

/// A pre-split URL template.
#[derive(Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    segments: Vec<Segment>,
}

impl UrlTemplate {
    /// Splits a template string. Unknown placeholders are kept verbatim.
    pub fn new(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            rest = &rest[open..];
            let Some(close) = rest.find('}') else {
                segments.push(Segment::Literal(rest.to_string()));
                rest = "";
                break;
            };
            let name = &rest[1..close];
            segments.push(match name {
                "lod" => Segment::Lod,
                "x" => Segment::X,
                "y" => Segment::Y,
                "loclod" => Segment::LocalLod,
                "locx" => Segment::LocalX,
                "locy" => Segment::LocalY,
                "sub" => Segment::Sub,
                _ => Segment::Literal(rest[..=close].to_string()),
            });
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Self { segments }
    }

    /// Expands the template with the given variables.
    pub fn expand(&self, vars: &UrlVars) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Lod => {
                    let _ = write!(out, "{}", vars.tile.lod);
                }
                Segment::X => {
                    let _ = write!(out, "{}", vars.tile.x);
                }
                Segment::Y => {
                    let _ = write!(out, "{}", vars.tile.y);
                }
                Segment::LocalLod => {
                    let _ = write!(out, "{}", vars.local.lod);
                }
                Segment::LocalX => {
                    let _ = write!(out, "{}", vars.local.x);
                }
                Segment::LocalY => {
                    let _ = write!(out, "{}", vars.local.y);
                }
                Segment::Sub => {
                    let _ = write!(out, "{}", vars.sub);
                }
            }
        }
        out
    }
}

impl fmt::Debug for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UrlTemplate(")?;
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => write!(f, "{s}")?,
                Segment::Lod => write!(f, "{{lod}}")?,
                Segment::X => write!(f, "{{x}}")?,
                Segment::Y => write!(f, "{{y}}")?,
                Segment::LocalLod => write!(f, "{{loclod}}")?,
                Segment::LocalX => write!(f, "{{locx}}")?,
                Segment::LocalY => write!(f, "{{locy}}")?,
                Segment::Sub => write!(f, "{{sub}}")?,
            }
        }
        write!(f, ")")
    }
}

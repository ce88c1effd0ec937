//! Declarative pipeline configuration.
//!
//! A configuration string is a sequence of `;`-separated stanzas, each a
//! sequence of `:`-separated fields. Whitespace inside fields is ignored
//! and `#` starts a comment running to end of line. The first field picks
//! `map` or `remap`, the second names a configurator, the rest are its
//! arguments: positional choices first, then `key` flags and `key=value`
//! pairs.
//!
//! ```
//! use ramses::MemorySystem;
//!
//! let msys = MemorySystem::load(
//!     "map:intel:sandy:2chan:pcibase=0xc0000000:tom=0x100000000; \
//!      remap:rankmirror:ddr3",
//! ).unwrap();
//! assert_eq!(msys.remaps().len(), 1);
//! ```

use core::str::FromStr;

use log::{debug, trace};
use thiserror::Error;

use crate::map::{IntelGeom, IntelOpts, Mapping};
use crate::remap::Remapping;

use super::MemorySystem;

/// What went wrong while loading a configuration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("unknown configuration type")]
    UnknownType,
    #[error("unknown configurator")]
    UnknownConfigurator,
    #[error("configurator not specified")]
    MissingConfigurator,
    #[error("missing positional argument")]
    MissingPositional,
    #[error("unknown positional argument value")]
    BadPositional,
    #[error("unknown argument")]
    UnknownArgument,
    #[error("flag argument supplied with value")]
    FlagWithValue,
    #[error("no value supplied to keyword argument")]
    MissingValue,
    #[error("bad format for numerical argument")]
    BadInt,
    #[error("configurator argument out of range")]
    BadConfigValue,
    #[error("no map stanza in configuration")]
    MissingMapping,
}

/// A [`ParseErrorKind`] plus the byte offset at which parsing stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at byte {offset}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

impl ParseError {
    fn new(kind: ParseErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    /// Positional choice; the parameter name enumerates the options.
    Choice,
    /// Presence flag.
    Flag,
    /// Integer with optional k/m/g/t suffix.
    Int,
    /// Free-form string.
    #[allow(dead_code)]
    Str,
}

struct ParamSpec {
    name: &'static str,
    kind: ParamKind,
}

struct ConfigSpec {
    name: &'static str,
    params: &'static [ParamSpec],
}

const MAP_CONFIGS: &[ConfigSpec] = &[
    ConfigSpec {
        name: "naive",
        params: &[ParamSpec { name: "ddr3:ddr4", kind: ParamKind::Choice }],
    },
    ConfigSpec {
        name: "intel",
        params: &[
            ParamSpec { name: "sandy:ivyhaswell", kind: ParamKind::Choice },
            ParamSpec { name: "2chan", kind: ParamKind::Flag },
            ParamSpec { name: "2dimm", kind: ParamKind::Flag },
            ParamSpec { name: "2rank", kind: ParamKind::Flag },
            ParamSpec { name: "pcibase", kind: ParamKind::Int },
            ParamSpec { name: "tom", kind: ParamKind::Int },
        ],
    },
];

const REMAP_CONFIGS: &[ConfigSpec] = &[
    ConfigSpec {
        name: "rankmirror",
        params: &[ParamSpec { name: "ddr3:ddr4", kind: ParamKind::Choice }],
    },
    ConfigSpec {
        name: "rasxor",
        params: &[
            ParamSpec { name: "bit", kind: ParamKind::Int },
            ParamSpec { name: "mask", kind: ParamKind::Int },
        ],
    },
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum ArgValue {
    #[default]
    Unset,
    Choice(usize),
    Flag,
    Int(i64),
    Str(String),
}

impl ArgValue {
    fn choice(&self) -> usize {
        match *self {
            Self::Choice(c) => c,
            _ => 0,
        }
    }

    fn flag(&self) -> bool {
        matches!(self, Self::Flag)
    }

    fn int(&self) -> i64 {
        match *self {
            Self::Int(v) => v,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sep {
    Colon,
    Semi,
    End,
}

struct FieldReader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(src: &'a str) -> Self {
        Self { src: src.as_bytes(), pos: 0 }
    }

    /// Next field with its start offset and the separator that ended it.
    fn next_field(&mut self) -> (String, usize, Sep) {
        let start = self.pos;
        let mut field = String::new();
        loop {
            match self.src.get(self.pos).copied() {
                None => return (field, start, Sep::End),
                Some(b':') => {
                    self.pos += 1;
                    return (field, start, Sep::Colon);
                }
                Some(b';') => {
                    self.pos += 1;
                    return (field, start, Sep::Semi);
                }
                Some(b'#') => {
                    while !matches!(self.src.get(self.pos).copied(), None | Some(b'\n')) {
                        self.pos += 1;
                    }
                }
                Some(c) => {
                    if !c.is_ascii_whitespace() {
                        field.push(c as char);
                    }
                    self.pos += 1;
                }
            }
        }
    }
}

/// Position of `s` in a `:`-separated option list.
fn opt_choice(s: &str, choices: &'static str) -> Option<usize> {
    choices.split(':').position(|c| c == s)
}

/// Keyword lookup among the not-yet-consumed parameters.
fn find_param(key: &str, params: &[ParamSpec], base: usize) -> Option<usize> {
    params[base..]
        .iter()
        .position(|p| p.kind != ParamKind::Choice && p.name == key)
        .map(|i| base + i)
}

fn suffix_shift(c: char) -> Option<u32> {
    match c.to_ascii_lowercase() {
        'k' => Some(10),
        'm' => Some(20),
        'g' => Some(30),
        't' => Some(40),
        _ => None,
    }
}

/// Integer with auto-detected base and optional scale suffix.
fn parse_int(s: &str) -> Option<i64> {
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (s, shift) = match s.chars().next_back().and_then(suffix_shift) {
        Some(shift) => (&s[..s.len() - 1], shift),
        None => (s, 0),
    };
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() {
        return None;
    }
    let val = i64::from_str_radix(digits, radix).ok()?;
    let val = val.checked_shl(shift).filter(|v| v >> shift == val)?;
    Some(if neg { -val } else { val })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CfgType {
    Map,
    Remap,
}

fn build_mapping(name: &str, args: &[ArgValue], offset: usize) -> Result<Mapping, ParseError> {
    match name {
        "naive" => Ok(if args[0].choice() == 0 { Mapping::NaiveDdr3 } else { Mapping::NaiveDdr4 }),
        "intel" => {
            let mut geom = IntelGeom::empty();
            geom.set(IntelGeom::DUALCHAN, args[1].flag());
            geom.set(IntelGeom::DUALDIMM, args[2].flag());
            geom.set(IntelGeom::DUALRANK, args[3].flag());
            let opts = IntelOpts {
                geom,
                pcibase: args[4].int() as u64,
                mem_top: args[5].int() as u64,
            };
            Ok(if args[0].choice() == 0 {
                Mapping::IntelSandy(opts)
            } else {
                Mapping::IntelIvyHaswell(opts)
            })
        }
        _ => Err(ParseError::new(ParseErrorKind::UnknownConfigurator, offset)),
    }
}

fn build_remap(name: &str, args: &[ArgValue], offset: usize) -> Result<Remapping, ParseError> {
    match name {
        "rankmirror" => Ok(if args[0].choice() == 0 {
            Remapping::RankMirrorDdr3
        } else {
            Remapping::RankMirrorDdr4
        }),
        "rasxor" => {
            let bit = args[0].int();
            let mask = args[1].int();
            if !(0..16).contains(&bit) || !(0..=0xffff).contains(&mask) {
                return Err(ParseError::new(ParseErrorKind::BadConfigValue, offset));
            }
            Ok(Remapping::RasXor { bit: bit as u32, mask: mask as u16 })
        }
        _ => Err(ParseError::new(ParseErrorKind::UnknownConfigurator, offset)),
    }
}

pub(super) fn parse(input: &str) -> Result<MemorySystem, ParseError> {
    let mut rd = FieldReader::new(input);
    let mut mapping: Option<Mapping> = None;
    let mut remaps: Vec<Remapping> = Vec::new();

    loop {
        let (field, off, sep) = rd.next_field();
        if field.is_empty() && sep == Sep::End {
            break;
        }
        let cfg_type = match field.as_str() {
            "map" => CfgType::Map,
            "remap" => CfgType::Remap,
            _ => return Err(ParseError::new(ParseErrorKind::UnknownType, off)),
        };
        if sep != Sep::Colon {
            return Err(ParseError::new(ParseErrorKind::MissingConfigurator, rd.pos));
        }

        let (name, name_off, mut sep) = rd.next_field();
        let table = match cfg_type {
            CfgType::Map => MAP_CONFIGS,
            CfgType::Remap => REMAP_CONFIGS,
        };
        let spec = table
            .iter()
            .find(|c| c.name == name)
            .ok_or(ParseError::new(ParseErrorKind::UnknownConfigurator, name_off))?;

        let mut args = vec![ArgValue::Unset; spec.params.len()];
        let mut parambase = 0;
        while sep == Sep::Colon {
            let (field, foff, next) = rd.next_field();
            sep = next;
            if parambase < spec.params.len()
                && spec.params[parambase].kind == ParamKind::Choice
            {
                let ch = opt_choice(&field, spec.params[parambase].name)
                    .ok_or(ParseError::new(ParseErrorKind::BadPositional, foff))?;
                args[parambase] = ArgValue::Choice(ch);
                parambase += 1;
                continue;
            }
            let (key, value) = match field.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (field.as_str(), None),
            };
            let par = find_param(key, spec.params, parambase)
                .ok_or(ParseError::new(ParseErrorKind::UnknownArgument, foff))?;
            args[par] = match spec.params[par].kind {
                ParamKind::Choice => unreachable!("find_param skips positionals"),
                ParamKind::Flag => {
                    if value.is_some() {
                        return Err(ParseError::new(ParseErrorKind::FlagWithValue, foff));
                    }
                    ArgValue::Flag
                }
                ParamKind::Int => {
                    let value = value
                        .filter(|v| !v.is_empty())
                        .ok_or(ParseError::new(ParseErrorKind::MissingValue, foff))?;
                    ArgValue::Int(
                        parse_int(value)
                            .ok_or(ParseError::new(ParseErrorKind::BadInt, foff))?,
                    )
                }
                ParamKind::Str => {
                    let value = value
                        .filter(|v| !v.is_empty())
                        .ok_or(ParseError::new(ParseErrorKind::MissingValue, foff))?;
                    ArgValue::Str(value.to_owned())
                }
            };
        }
        if parambase < spec.params.len() && spec.params[parambase].kind == ParamKind::Choice {
            return Err(ParseError::new(ParseErrorKind::MissingPositional, rd.pos));
        }

        match cfg_type {
            CfgType::Map => {
                trace!("configured map `{name}`");
                mapping = Some(build_mapping(&name, &args, name_off)?);
            }
            CfgType::Remap => {
                trace!("appended remap `{name}`");
                remaps.push(build_remap(&name, &args, name_off)?);
            }
        }
        if sep == Sep::End {
            break;
        }
    }

    let mapping = mapping
        .ok_or(ParseError::new(ParseErrorKind::MissingMapping, input.len()))?;
    debug!("loaded memory system: {:?}, {} remaps", mapping, remaps.len());
    Ok(MemorySystem::with_remaps(mapping, remaps))
}

impl MemorySystem {
    /// Wire up a memory system from its textual description.
    pub fn load(s: &str) -> Result<Self, ParseError> {
        parse(s)
    }
}

impl FromStr for MemorySystem {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

//! DungeonNet message types and their compact binary body encoding.
//!
//! A body is one tag byte followed by the variant's fields in a fixed order. Text is always
//! the last field and runs to the end of the body, so bodies are not self-delimiting; the
//! wire module supplies the length prefix.

/// Version carried by `Hello`. Changes with any non-binary-compatible change to `Message`.
pub const PROTOCOL_VERSION: u8 = 0;

const TAG_HELLO: u8 = 0x00;
const TAG_BEGIN_ENCOUNTER: u8 = 0x01;
const TAG_INSERT_COMBATANT: u8 = 0x02;
const TAG_DELETE_COMBATANT: u8 = 0x03;
const TAG_UPDATE_COMBATANT: u8 = 0x04;
const TAG_MOVE_COMBATANT: u8 = 0x05;
const TAG_ROUND: u8 = 0x06;
const TAG_INITIATIVE: u8 = 0x07;
const TAG_END_TURN: u8 = 0x08;

/// Raw byte meaning "no initiative rolled" in optional initiative fields.
pub const NULL_INITIATIVE: u8 = 0x80;

/// Lowest initiative an optional initiative field can carry.
pub const MIN_INITIATIVE: i8 = -127;

/// All wire message types exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        version: u8,
    },
    BeginEncounter {
        title: String,
    },
    InsertCombatant {
        to_index: u8,
        name: String,
        initiative: Option<i8>,
        is_current_turn: bool,
        is_alive: bool,
    },
    DeleteCombatant {
        from_index: u8,
    },
    UpdateCombatant {
        index: u8,
        name: String,
        initiative: Option<i8>,
        is_current_turn: bool,
        is_alive: bool,
    },
    MoveCombatant {
        from_index: u8,
        to_index: u8,
    },
    Round {
        round: u8,
    },
    /// A player reporting their initiative roll.
    Initiative {
        name: String,
        initiative: i8,
    },
    /// A player ending their own turn.
    EndTurn {
        name: String,
    },
}

impl Message {
    /// Discriminant byte written first in the body.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Hello { .. } => TAG_HELLO,
            Message::BeginEncounter { .. } => TAG_BEGIN_ENCOUNTER,
            Message::InsertCombatant { .. } => TAG_INSERT_COMBATANT,
            Message::DeleteCombatant { .. } => TAG_DELETE_COMBATANT,
            Message::UpdateCombatant { .. } => TAG_UPDATE_COMBATANT,
            Message::MoveCombatant { .. } => TAG_MOVE_COMBATANT,
            Message::Round { .. } => TAG_ROUND,
            Message::Initiative { .. } => TAG_INITIATIVE,
            Message::EndTurn { .. } => TAG_END_TURN,
        }
    }

    /// Encode into a message body. Never fails.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.tag()];
        match self {
            Message::Hello { version } => out.push(*version),
            Message::BeginEncounter { title } => out.extend_from_slice(title.as_bytes()),
            Message::InsertCombatant {
                to_index: index,
                name,
                initiative,
                is_current_turn,
                is_alive,
            }
            | Message::UpdateCombatant {
                index,
                name,
                initiative,
                is_current_turn,
                is_alive,
            } => {
                out.push(*index);
                out.push(encode_optional_initiative(*initiative));
                out.push(u8::from(*is_current_turn));
                out.push(u8::from(*is_alive));
                out.extend_from_slice(name.as_bytes());
            }
            Message::DeleteCombatant { from_index } => out.push(*from_index),
            Message::MoveCombatant {
                from_index,
                to_index,
            } => {
                out.push(*from_index);
                out.push(*to_index);
            }
            Message::Round { round } => out.push(*round),
            Message::Initiative { name, initiative } => {
                out.push(*initiative as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Message::EndTurn { name } => out.extend_from_slice(name.as_bytes()),
        }
        out
    }

    /// Decode a complete message body.
    pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
        let (&tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
        match tag {
            TAG_HELLO => {
                let [version] = exact::<1>(tag, body)?;
                Ok(Message::Hello { version })
            }
            TAG_BEGIN_ENCOUNTER => Ok(Message::BeginEncounter {
                title: text(tag, body)?,
            }),
            TAG_INSERT_COMBATANT => {
                let ([to_index, initiative, current, alive], rest) = fixed::<4>(tag, body)?;
                Ok(Message::InsertCombatant {
                    to_index,
                    name: text(tag, rest)?,
                    initiative: decode_optional_initiative(initiative),
                    is_current_turn: current != 0,
                    is_alive: alive != 0,
                })
            }
            TAG_DELETE_COMBATANT => {
                let [from_index] = exact::<1>(tag, body)?;
                Ok(Message::DeleteCombatant { from_index })
            }
            TAG_UPDATE_COMBATANT => {
                let ([index, initiative, current, alive], rest) = fixed::<4>(tag, body)?;
                Ok(Message::UpdateCombatant {
                    index,
                    name: text(tag, rest)?,
                    initiative: decode_optional_initiative(initiative),
                    is_current_turn: current != 0,
                    is_alive: alive != 0,
                })
            }
            TAG_MOVE_COMBATANT => {
                let [from_index, to_index] = exact::<2>(tag, body)?;
                Ok(Message::MoveCombatant {
                    from_index,
                    to_index,
                })
            }
            TAG_ROUND => {
                let [round] = exact::<1>(tag, body)?;
                Ok(Message::Round { round })
            }
            TAG_INITIATIVE => {
                let ([initiative], rest) = fixed::<1>(tag, body)?;
                Ok(Message::Initiative {
                    name: text(tag, rest)?,
                    initiative: initiative as i8,
                })
            }
            TAG_END_TURN => Ok(Message::EndTurn {
                name: text(tag, body)?,
            }),
            _ => Err(DecodeError::UnknownTag(tag)),
        }
    }
}

/// `-128` shares its bit pattern with the null sentinel, so it saturates to `-127`.
fn encode_optional_initiative(initiative: Option<i8>) -> u8 {
    match initiative {
        Some(value) => value.max(MIN_INITIATIVE) as u8,
        None => NULL_INITIATIVE,
    }
}

fn decode_optional_initiative(byte: u8) -> Option<i8> {
    if byte == NULL_INITIATIVE {
        None
    } else {
        Some(byte as i8)
    }
}

/// Fixed-size variants: the body must be exactly `N` bytes.
fn exact<const N: usize>(tag: u8, body: &[u8]) -> Result<[u8; N], DecodeError> {
    let (fields, rest) = fixed::<N>(tag, body)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(tag));
    }
    Ok(fields)
}

fn fixed<const N: usize>(tag: u8, body: &[u8]) -> Result<([u8; N], &[u8]), DecodeError> {
    if body.len() < N {
        return Err(DecodeError::Truncated {
            tag,
            len: body.len() + 1,
        });
    }
    let (head, rest) = body.split_at(N);
    let mut fields = [0u8; N];
    fields.copy_from_slice(head);
    Ok((fields, rest))
}

fn text(tag: u8, bytes: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8(tag))
}

/// Why a message body could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message body")]
    Empty,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("message tag {tag:#04x} truncated at {len} bytes")]
    Truncated { tag: u8, len: usize },
    #[error("trailing bytes after message tag {0:#04x}")]
    TrailingBytes(u8),
    #[error("invalid utf-8 text in message tag {0:#04x}")]
    InvalidUtf8(u8),
}

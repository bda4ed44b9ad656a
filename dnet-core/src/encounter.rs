//! Encounter state on both sides of the table.
//!
//! The Primary owns an [`Encounter`] and turns every change into the messages that describe
//! it. A Secondary keeps an [`InitiativeOrder`] replica by applying those messages in order.

use crate::protocol::{Message, MIN_INITIATIVE};

/// Combatant indices travel as one byte.
pub const MAX_COMBATANTS: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combatant {
    pub name: String,
    pub initiative: Option<i8>,
    pub is_current_turn: bool,
    pub is_alive: bool,
}

impl Combatant {
    /// A living combatant who does not hold the turn.
    pub fn new(name: impl Into<String>, initiative: Option<i8>) -> Self {
        Self {
            name: name.into(),
            initiative,
            is_current_turn: false,
            is_alive: true,
        }
    }

    fn insert_message(&self, index: usize) -> Message {
        Message::InsertCombatant {
            to_index: wire_index(index),
            name: self.name.clone(),
            initiative: self.initiative,
            is_current_turn: self.is_current_turn,
            is_alive: self.is_alive,
        }
    }

    fn update_message(&self, index: usize) -> Message {
        Message::UpdateCombatant {
            index: wire_index(index),
            name: self.name.clone(),
            initiative: self.initiative,
            is_current_turn: self.is_current_turn,
            is_alive: self.is_alive,
        }
    }

    /// Same initiative and same name: acts together in one turn.
    fn shares_turn_with(&self, other: &Combatant) -> bool {
        self.initiative == other.initiative && self.name == other.name
    }
}

// Indices stay below MAX_COMBATANTS, which `Encounter::new` enforces.
fn wire_index(index: usize) -> u8 {
    index as u8
}

#[derive(Debug, thiserror::Error)]
pub enum EncounterError {
    #[error("encounter has {0} combatants, at most {MAX_COMBATANTS} fit on the wire")]
    TooManyCombatants(usize),
}

/// The authoritative encounter held by the Primary. Combatants are kept in initiative order,
/// highest first, combatants without a roll last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encounter {
    title: String,
    round: u8,
    combatants: Vec<Combatant>,
}

impl Encounter {
    pub fn new(
        title: impl Into<String>,
        round: u8,
        mut combatants: Vec<Combatant>,
    ) -> Result<Self, EncounterError> {
        if combatants.len() > MAX_COMBATANTS {
            return Err(EncounterError::TooManyCombatants(combatants.len()));
        }
        for combatant in &mut combatants {
            combatant.initiative = combatant.initiative.map(|i| i.max(MIN_INITIATIVE));
        }
        // Option orders None below Some, so descending puts unrolled combatants last.
        combatants.sort_by(|a, b| b.initiative.cmp(&a.initiative));
        Ok(Self {
            title: title.into(),
            round,
            combatants,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn round(&self) -> u8 {
        self.round
    }

    pub fn combatants(&self) -> &[Combatant] {
        &self.combatants
    }

    /// Messages that bring a fresh replica up to date.
    pub fn snapshot(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.combatants.len() + 2);
        messages.push(Message::BeginEncounter {
            title: self.title.clone(),
        });
        messages.extend(
            self.combatants
                .iter()
                .enumerate()
                .map(|(index, combatant)| combatant.insert_message(index)),
        );
        messages.push(Message::Round { round: self.round });
        messages
    }

    /// Record an initiative roll for every combatant with `name`, moving each into place.
    /// Rolls below `MIN_INITIATIVE` are stored as `MIN_INITIATIVE`.
    pub fn set_initiative(&mut self, name: &str, initiative: i8) -> Vec<Message> {
        let initiative = initiative.max(MIN_INITIATIVE);
        let mut messages = Vec::new();
        while let Some(from) = self
            .combatants
            .iter()
            .position(|c| c.name == name && c.initiative != Some(initiative))
        {
            let mut combatant = self.combatants.remove(from);
            combatant.initiative = Some(initiative);
            let to = self
                .combatants
                .iter()
                .position(|c| c.initiative < combatant.initiative)
                .unwrap_or(self.combatants.len());
            if from != to {
                messages.push(Message::MoveCombatant {
                    from_index: wire_index(from),
                    to_index: wire_index(to),
                });
            }
            messages.push(combatant.update_message(to));
            self.combatants.insert(to, combatant);
        }
        messages
    }

    /// Pass the turn to the next group of living combatants. Returns the updates, followed
    /// by the new round when the order wrapped.
    pub fn next_turn(&mut self) -> Vec<Message> {
        let before: Vec<bool> = self.combatants.iter().map(|c| c.is_current_turn).collect();
        let first_turn = before.iter().position(|&t| t);
        let last_turn = before.iter().rposition(|&t| t);
        for combatant in &mut self.combatants {
            combatant.is_current_turn = false;
        }

        let start = last_turn.map_or(0, |index| index + 1);
        let len = self.combatants.len();
        let order: Vec<usize> = (start..len)
            .chain(0..start)
            .filter(|&index| self.combatants[index].is_alive)
            .collect();
        if let Some(&lead) = order.first() {
            let lead = self.combatants[lead].clone();
            for index in order {
                if !self.combatants[index].shares_turn_with(&lead) {
                    break;
                }
                self.combatants[index].is_current_turn = true;
            }
        }

        let mut messages: Vec<Message> = self
            .combatants
            .iter()
            .enumerate()
            .filter(|(index, combatant)| combatant.is_current_turn != before[*index])
            .map(|(index, combatant)| combatant.update_message(index))
            .collect();

        let new_turn = self.combatants.iter().position(|c| c.is_current_turn);
        if let (Some(new_turn), Some(first_turn)) = (new_turn, first_turn) {
            if new_turn <= first_turn {
                self.round = self.round.saturating_add(1);
                messages.push(Message::Round { round: self.round });
            }
        }
        messages
    }

    /// A player ended their turn. Only the combatant holding the turn can end it.
    pub fn end_turn(&mut self, name: &str) -> Vec<Message> {
        if self
            .combatants
            .iter()
            .any(|c| c.is_current_turn && c.name == name)
        {
            self.next_turn()
        } else {
            Vec::new()
        }
    }

    /// Bump the round counter without moving the turn.
    pub fn advance_round(&mut self) -> Message {
        self.round = self.round.saturating_add(1);
        Message::Round { round: self.round }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("combatant index {index} out of range for {len} combatants")]
    IndexOutOfRange { index: u8, len: usize },
}

/// Replica of the Primary's encounter, rebuilt from the message stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitiativeOrder {
    title: Option<String>,
    round: u8,
    combatants: Vec<Combatant>,
}

impl InitiativeOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Title of the encounter in progress, once one has begun.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn round(&self) -> u8 {
        self.round
    }

    pub fn combatants(&self) -> &[Combatant] {
        &self.combatants
    }

    /// Apply one change. Messages that do not describe the encounter are ignored.
    pub fn apply(&mut self, message: &Message) -> Result<(), ApplyError> {
        match message {
            Message::BeginEncounter { title } => {
                self.title = Some(title.clone());
                self.combatants.clear();
            }
            Message::InsertCombatant {
                to_index,
                name,
                initiative,
                is_current_turn,
                is_alive,
            } => {
                let index = self.check(*to_index, self.combatants.len() + 1)?;
                self.combatants.insert(
                    index,
                    Combatant {
                        name: name.clone(),
                        initiative: *initiative,
                        is_current_turn: *is_current_turn,
                        is_alive: *is_alive,
                    },
                );
            }
            Message::DeleteCombatant { from_index } => {
                let index = self.check(*from_index, self.combatants.len())?;
                self.combatants.remove(index);
            }
            Message::UpdateCombatant {
                index,
                name,
                initiative,
                is_current_turn,
                is_alive,
            } => {
                let index = self.check(*index, self.combatants.len())?;
                self.combatants[index] = Combatant {
                    name: name.clone(),
                    initiative: *initiative,
                    is_current_turn: *is_current_turn,
                    is_alive: *is_alive,
                };
            }
            Message::MoveCombatant {
                from_index,
                to_index,
            } => {
                let from = self.check(*from_index, self.combatants.len())?;
                let to = self.check(*to_index, self.combatants.len())?;
                let combatant = self.combatants.remove(from);
                self.combatants.insert(to, combatant);
            }
            Message::Round { round } => self.round = *round,
            Message::Hello { .. } | Message::Initiative { .. } | Message::EndTurn { .. } => {}
        }
        Ok(())
    }

    fn check(&self, index: u8, bound: usize) -> Result<usize, ApplyError> {
        let i = usize::from(index);
        if i < bound {
            Ok(i)
        } else {
            Err(ApplyError::IndexOutOfRange {
                index,
                len: self.combatants.len(),
            })
        }
    }

    /// The first combatant holding the turn.
    pub fn current_turn(&self) -> Option<&Combatant> {
        self.combatants.iter().find(|c| c.is_current_turn)
    }

    /// The first living combatant after the last turn holder, wrapping around.
    pub fn next_up(&self) -> Option<&Combatant> {
        let start = self
            .combatants
            .iter()
            .rposition(|c| c.is_current_turn)
            .map_or(0, |index| index + 1);
        self.combatants[start..]
            .iter()
            .chain(&self.combatants[..start])
            .find(|c| c.is_alive)
    }
}

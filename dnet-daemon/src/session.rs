//! Role behaviour at the table: the Primary runs the encounter, a Secondary mirrors it.

use std::fmt::Write as _;
use std::str::FromStr;

use dnet_core::{
    Combatant, Connection, ConnectionObserver, Encounter, InitiativeOrder, Message, PeerObserver,
    ServiceRecord, PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

/// Operator command read from stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Advance to the next turn (Primary).
    Next,
    /// Bump the round counter (Primary).
    Round,
    /// Report an initiative roll.
    Initiative { name: String, initiative: i8 },
    /// End the named combatant's turn.
    EndTurn { name: String },
    Show,
    Quit,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match word.to_ascii_lowercase().as_str() {
            "next" => Ok(Command::Next),
            "round" => Ok(Command::Round),
            "show" => Ok(Command::Show),
            "quit" | "exit" => Ok(Command::Quit),
            "init" => {
                let (name, value) = rest
                    .rsplit_once(char::is_whitespace)
                    .ok_or(ParseCommandError::Usage("init <name> <initiative>"))?;
                let initiative = value
                    .parse()
                    .map_err(|_| ParseCommandError::Usage("init <name> <initiative>"))?;
                Ok(Command::Initiative {
                    name: name.trim().to_string(),
                    initiative,
                })
            }
            "end" if !rest.is_empty() => Ok(Command::EndTurn {
                name: rest.to_string(),
            }),
            "end" => Err(ParseCommandError::Usage("end <name>")),
            _ => Err(ParseCommandError::Unknown(word.to_string())),
        }
    }
}

enum Table {
    Primary(Encounter),
    Secondary(InitiativeOrder),
}

/// Observer for the peer manager. Messages for every connection are queued in the outbox
/// and broadcast by the event loop.
pub struct Session {
    table: Table,
    outbox: Vec<Message>,
    closed_services: Vec<ServiceRecord>,
    connected: usize,
}

impl Session {
    pub fn primary(encounter: Encounter) -> Self {
        Self::new(Table::Primary(encounter))
    }

    pub fn secondary() -> Self {
        Self::new(Table::Secondary(InitiativeOrder::new()))
    }

    fn new(table: Table) -> Self {
        Self {
            table,
            outbox: Vec::new(),
            closed_services: Vec::new(),
            connected: 0,
        }
    }

    /// Messages waiting to be broadcast.
    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    /// Services whose connections closed since the last call.
    pub fn take_closed_services(&mut self) -> Vec<ServiceRecord> {
        std::mem::take(&mut self.closed_services)
    }

    pub fn execute(&mut self, command: Command) {
        match command {
            Command::Show => print!("{}", self.render()),
            Command::Quit => {}
            command => self.apply_command(command),
        }
    }

    fn apply_command(&mut self, command: Command) {
        match (&mut self.table, command) {
            (Table::Primary(encounter), Command::Next) => {
                self.outbox.extend(encounter.next_turn());
            }
            (Table::Primary(encounter), Command::Round) => {
                self.outbox.push(encounter.advance_round());
            }
            (Table::Primary(encounter), Command::Initiative { name, initiative }) => {
                self.outbox.extend(encounter.set_initiative(&name, initiative));
            }
            (Table::Primary(encounter), Command::EndTurn { name }) => {
                self.outbox.extend(encounter.end_turn(&name));
            }
            (Table::Secondary(_), Command::Initiative { name, initiative }) => {
                self.outbox.push(Message::Initiative { name, initiative });
            }
            (Table::Secondary(_), Command::EndTurn { name }) => {
                self.outbox.push(Message::EndTurn { name });
            }
            (Table::Secondary(_), Command::Next | Command::Round) => {
                warn!("only the dungeon master can advance the encounter");
            }
            (_, Command::Show | Command::Quit) => {}
        }
    }

    /// Current state as shown by `show`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let (title, round, combatants) = match &self.table {
            Table::Primary(e) => (Some(e.title()), e.round(), e.combatants()),
            Table::Secondary(o) => (o.title(), o.round(), o.combatants()),
        };
        let _ = writeln!(
            out,
            "{} (round {}, {} connected)",
            title.unwrap_or("Searching for Dungeon Master"),
            round,
            self.connected
        );
        for c in combatants {
            let _ = writeln!(out, "{}", render_combatant(c));
        }
        if let Table::Secondary(order) = &self.table {
            if let Some(next) = order.next_up() {
                let _ = writeln!(out, "next up: {}", next.name);
            }
        }
        out
    }

    fn primary_message(encounter: &mut Encounter, message: Message) -> Vec<Message> {
        match message {
            Message::Initiative { name, initiative } => {
                info!(%name, initiative, "initiative roll");
                encounter.set_initiative(&name, initiative)
            }
            Message::EndTurn { name } => {
                info!(%name, "end turn");
                encounter.end_turn(&name)
            }
            other => {
                debug!(message = ?other, "ignoring message");
                Vec::new()
            }
        }
    }
}

fn render_combatant(c: &Combatant) -> String {
    let marker = if c.is_current_turn { '>' } else { ' ' };
    let initiative = c
        .initiative
        .map_or_else(|| "-".to_string(), |i| i.to_string());
    let dead = if c.is_alive { "" } else { " (dead)" };
    format!("{marker} {initiative:>4}  {}{dead}", c.name)
}

impl ConnectionObserver for Session {
    fn on_message(&mut self, connection: &mut Connection, message: Message) {
        if let Message::Hello { version } = message {
            if version != PROTOCOL_VERSION {
                warn!(peer = %connection.peer_id(), version, "protocol version mismatch");
                connection.close();
            }
            return;
        }
        match &mut self.table {
            Table::Primary(encounter) => {
                let changes = Self::primary_message(encounter, message);
                self.outbox.extend(changes);
            }
            Table::Secondary(order) => {
                if let Err(e) = order.apply(&message) {
                    warn!(peer = %connection.peer_id(), error = %e, "encounter out of sync");
                    connection.close();
                    return;
                }
                if matches!(message, Message::Round { .. } | Message::UpdateCombatant { .. }) {
                    if let Some(turn) = order.current_turn() {
                        info!(
                            round = order.round(),
                            turn = %turn.name,
                            next = order.next_up().map(|c| c.name.as_str()).unwrap_or(""),
                            "initiative order"
                        );
                    }
                }
            }
        }
    }

    fn on_closed(&mut self, connection: &Connection) {
        info!(peer = %connection.peer_id(), "lost connection");
        self.connected = self.connected.saturating_sub(1);
        if let Some(service) = connection.service() {
            self.closed_services.push(service.clone());
        }
    }
}

impl PeerObserver for Session {
    fn on_connection_established(&mut self, connection: &mut Connection) {
        info!(peer = %connection.peer_id(), role = %connection.role(), "connected");
        self.connected += 1;
        if let Table::Primary(encounter) = &self.table {
            connection.send(Message::Hello {
                version: PROTOCOL_VERSION,
            });
            for message in encounter.snapshot() {
                connection.send(message);
            }
        }
    }
}

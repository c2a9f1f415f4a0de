//! Command catalogue.
//!
//! This module defines:
//! - the numeric command ids multiplexed over one client connection,
//! - the content sub-kinds carried inside send commands.
//!
//! Ids start at 1; `0` is reserved as the "unknown command" sentinel
//! returned when a header does not resolve.

/// Numeric identifier of a command on the wire.
pub type CommandId = u32;

/// Sentinel id for a header that resolves to no registered command.
pub const UNKNOWN_COMMAND: CommandId = 0;

/// Every command understood by the server.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Send to a single user.
    SendOne = 1,
    /// Send to many users.
    SendMany = 2,
    /// Send to a chat group.
    SendGroup = 3,
    /// Send to a room.
    SendRoom = 4,

    CreateGroup = 5,
    CreateRoom = 6,

    /// Add a user as friend.
    AddOne = 7,
    /// Add many users as friends.
    AddMany = 8,
    JoinRoom = 9,
    JoinGroup = 10,

    DeleteGroup = 11,
    DeleteRoom = 12,
    /// Delete a friend.
    DeleteOne = 13,
    /// Delete many friends.
    DeleteMany = 14,

    /// Create a friend list group, like "family" or "workmate".
    CreateListGroup = 15,
    /// Create a room group, like "family", "workmate" or "game".
    CreateRoomGroup = 16,

    /// Remark a friend.
    AddOneRemark = 17,
    /// Remark a room.
    AddRoomRemark = 18,
    /// Remark a group.
    AddGroupRemark = 19,
}

/// Coarse grouping of commands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Category {
    DirectSend,
    BroadcastSend,
    Lifecycle,
    Friend,
    Remark,
}

impl Command {
    /// All commands, in id order.
    pub const ALL: [Command; 19] = [
        Command::SendOne,
        Command::SendMany,
        Command::SendGroup,
        Command::SendRoom,
        Command::CreateGroup,
        Command::CreateRoom,
        Command::AddOne,
        Command::AddMany,
        Command::JoinRoom,
        Command::JoinGroup,
        Command::DeleteGroup,
        Command::DeleteRoom,
        Command::DeleteOne,
        Command::DeleteMany,
        Command::CreateListGroup,
        Command::CreateRoomGroup,
        Command::AddOneRemark,
        Command::AddRoomRemark,
        Command::AddGroupRemark,
    ];

    pub fn id(self) -> CommandId {
        self as CommandId
    }

    pub fn from_id(id: CommandId) -> Option<Self> {
        match id {
            1..=19 => Some(Self::ALL[(id - 1) as usize]),
            _ => None,
        }
    }

    /// Ids of the whole catalogue, ready for `register_commands`.
    pub fn all_ids() -> Vec<CommandId> {
        Self::ALL.iter().map(|c| c.id()).collect()
    }

    pub fn category(self) -> Category {
        use Command::*;
        match self {
            SendOne => Category::DirectSend,
            SendMany | SendGroup | SendRoom => Category::BroadcastSend,
            CreateGroup | CreateRoom | JoinRoom | JoinGroup | DeleteGroup | DeleteRoom
            | CreateListGroup | CreateRoomGroup => Category::Lifecycle,
            AddOne | AddMany | DeleteOne | DeleteMany => Category::Friend,
            AddOneRemark | AddRoomRemark | AddGroupRemark => Category::Remark,
        }
    }

    /// Human meaning of the command, for logs.
    pub fn description(self) -> &'static str {
        match self {
            Command::SendOne => "send to a user",
            Command::SendMany => "send to many users",
            Command::SendGroup => "send to a chat group",
            Command::SendRoom => "send to a room",
            Command::CreateGroup => "create a chat group",
            Command::CreateRoom => "create a chat room",
            Command::AddOne => "add a user as friend",
            Command::AddMany => "add many users as friends",
            Command::JoinRoom => "join a chat room",
            Command::JoinGroup => "join a chat group",
            Command::DeleteGroup => "delete a chat group",
            Command::DeleteRoom => "delete a chat room",
            Command::DeleteOne => "delete a friend",
            Command::DeleteMany => "delete many friends",
            Command::CreateListGroup => "create a friend list group",
            Command::CreateRoomGroup => "create a room group",
            Command::AddOneRemark => "remark a friend",
            Command::AddRoomRemark => "remark a room",
            Command::AddGroupRemark => "remark a group",
        }
    }
}

/// Kind of content carried by a send command.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Text = 1,
    Voice = 2,
    Image = 3,
    File = 4,
    FileFolder = 5,
    Video = 6,
    Url = 7,
}

impl ContentKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ContentKind::Text),
            2 => Some(ContentKind::Voice),
            3 => Some(ContentKind::Image),
            4 => Some(ContentKind::File),
            5 => Some(ContentKind::FileFolder),
            6 => Some(ContentKind::Video),
            7 => Some(ContentKind::Url),
            _ => None,
        }
    }
}

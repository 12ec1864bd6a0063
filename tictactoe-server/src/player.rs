//! 座位管理
//!
//! 每个房间两个座位（X、O），座位状态显式区分空位、在座和断线保留。

use protocol::{ConnectionId, Identity, Role, SeatNames};

/// 座位状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Seat {
    /// 空位
    #[default]
    Empty,
    /// 在座（绑定一个存活连接）
    Occupied {
        player: Identity,
        connection: ConnectionId,
    },
    /// 玩家断线，座位保留给原玩家
    Vacated { player: Identity },
}

impl Seat {
    /// 座位上的玩家（在座或断线保留）
    pub fn player(&self) -> Option<&Identity> {
        match self {
            Seat::Empty => None,
            Seat::Occupied { player, .. } | Seat::Vacated { player } => Some(player),
        }
    }

    /// 绑定的连接
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Seat::Occupied { connection, .. } => Some(*connection),
            _ => None,
        }
    }

    pub fn is_occupied(&self) -> bool {
        matches!(self, Seat::Occupied { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Seat::Empty)
    }

    pub fn is_vacated(&self) -> bool {
        matches!(self, Seat::Vacated { .. })
    }

    /// 对外展示的昵称（仅在座时可见）
    pub fn display_name(&self) -> Option<String> {
        match self {
            Seat::Occupied { player, .. } => Some(player.display_name.clone()),
            _ => None,
        }
    }
}

/// 房间的两个座位
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Seats {
    x: Seat,
    o: Seat,
}

impl Seats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, role: Role) -> &Seat {
        match role {
            Role::X => &self.x,
            Role::O => &self.o,
        }
    }

    fn get_mut(&mut self, role: Role) -> &mut Seat {
        match role {
            Role::X => &mut self.x,
            Role::O => &mut self.o,
        }
    }

    /// 查找玩家所在座位（包括断线保留的座位）
    pub fn find_player(&self, player_id: &str) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|&role| self.get(role).player().is_some_and(|p| p.id == player_id))
    }

    /// 第一个空位（X 优先）
    pub fn first_empty(&self) -> Option<Role> {
        Role::ALL.into_iter().find(|&role| self.get(role).is_empty())
    }

    /// 第一个断线保留的座位（X 优先）
    pub fn first_vacated(&self) -> Option<Role> {
        Role::ALL.into_iter().find(|&role| self.get(role).is_vacated())
    }

    /// 两个座位都在座
    pub fn both_occupied(&self) -> bool {
        self.x.is_occupied() && self.o.is_occupied()
    }

    /// 两个座位都没有存活连接
    pub fn all_unbound(&self) -> bool {
        !self.x.is_occupied() && !self.o.is_occupied()
    }

    /// 把玩家绑定到座位，返回被替换的旧连接
    pub fn bind(&mut self, role: Role, player: Identity, connection: ConnectionId) -> Option<ConnectionId> {
        let seat = self.get_mut(role);
        let replaced = seat.connection();
        *seat = Seat::Occupied { player, connection };
        replaced
    }

    /// 解除座位的连接绑定
    ///
    /// 只有当前绑定的连接才能解除，旧连接（已被重连替换）返回 false。
    pub fn vacate(&mut self, role: Role, connection: ConnectionId) -> bool {
        let seat = self.get_mut(role);
        match seat {
            Seat::Occupied {
                player,
                connection: bound,
            } if *bound == connection => {
                let player = player.clone();
                *seat = Seat::Vacated { player };
                true
            }
            _ => false,
        }
    }

    /// `connection` 是否绑定在 `role` 上
    pub fn is_bound(&self, role: Role, connection: ConnectionId) -> bool {
        self.get(role).connection() == Some(connection)
    }

    /// 所有存活连接
    pub fn connections(&self) -> Vec<ConnectionId> {
        Role::ALL
            .into_iter()
            .filter_map(|role| self.get(role).connection())
            .collect()
    }

    pub fn names(&self) -> SeatNames {
        SeatNames {
            x: self.x.display_name(),
            o: self.o.display_name(),
        }
    }
}

//! 角色与胜负定义

use std::fmt;

use serde::{Deserialize, Serialize};

/// 角色（棋盘上的两种记号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// X 方（先手）
    X,
    /// O 方（后手）
    O,
}

impl Role {
    /// 两个角色，按分配优先级排列
    pub const ALL: [Role; 2] = [Role::X, Role::O];

    /// 获取对方角色
    pub fn opponent(&self) -> Role {
        match self {
            Role::X => Role::O,
            Role::O => Role::X,
        }
    }

    /// 显示字符
    pub fn symbol(&self) -> char {
        match self {
            Role::X => 'X',
            Role::O => 'O',
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// 对局胜负
///
/// 一旦设置就不再改变，除非休闲模式下显式重开。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Winner {
    X,
    O,
    #[serde(rename = "draw")]
    Draw,
}

impl Winner {
    /// 由获胜角色构造
    pub fn from_role(role: Role) -> Self {
        match role {
            Role::X => Winner::X,
            Role::O => Winner::O,
        }
    }

    /// 获胜角色（和棋时为 None）
    pub fn role(&self) -> Option<Role> {
        match self {
            Winner::X => Some(Role::X),
            Winner::O => Some(Role::O),
            Winner::Draw => None,
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::X => write!(f, "X"),
            Winner::O => write!(f, "O"),
            Winner::Draw => write!(f, "draw"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opponent() {
        assert_eq!(Role::X.opponent(), Role::O);
        assert_eq!(Role::O.opponent(), Role::X);
    }

    #[test]
    fn test_winner_role() {
        assert_eq!(Winner::from_role(Role::O).role(), Some(Role::O));
        assert_eq!(Winner::Draw.role(), None);
    }

    #[test]
    fn test_winner_json_names() {
        assert_eq!(serde_json::to_string(&Winner::Draw).unwrap(), "\"draw\"");
        assert_eq!(serde_json::to_string(&Role::X).unwrap(), "\"X\"");
    }
}

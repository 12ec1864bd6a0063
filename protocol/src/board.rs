//! 棋盘与胜负判定
//!
//! 纯函数实现，不持有任何共享状态，结果只取决于棋盘内容。

use serde::{Deserialize, Serialize};

use crate::constants::{BOARD_CELLS, WINNING_LINES};
use crate::error::GameError;
use crate::role::{Role, Winner};

/// 棋盘
///
/// 9 个格子按 0-8 编号，行优先。格子一旦落子就不会被覆盖。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    cells: [Option<Role>; BOARD_CELLS],
}

impl Board {
    /// 创建空棋盘
    pub fn empty() -> Self {
        Self::default()
    }

    /// 获取指定格子（越界返回 None）
    pub fn get(&self, index: u8) -> Option<Role> {
        self.cells.get(index as usize).copied().flatten()
    }

    /// 已落子数
    pub fn mark_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// 是否下满
    pub fn is_full(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    /// 是否为空棋盘
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    /// 落子，返回新棋盘
    ///
    /// 越界或目标格已有子时失败，原棋盘不变。
    pub fn apply_move(&self, role: Role, index: u8) -> Result<Board, GameError> {
        let slot = index as usize;
        if slot >= BOARD_CELLS {
            return Err(GameError::OutOfRange { index });
        }
        if self.cells[slot].is_some() {
            return Err(GameError::Occupied { index });
        }

        let mut next = *self;
        next.cells[slot] = Some(role);
        Ok(next)
    }

    /// 按固定优先级查找第一条连成一线的三格
    pub fn winning_line(&self) -> Option<[u8; 3]> {
        WINNING_LINES.iter().copied().find(|&[a, b, c]| {
            let first = self.get(a);
            first.is_some() && first == self.get(b) && first == self.get(c)
        })
    }

    /// 判定胜负：有连线则该方胜，下满无连线为和棋，否则未分胜负
    pub fn evaluate(&self) -> Option<Winner> {
        if let Some([a, _, _]) = self.winning_line() {
            return self.get(a).map(Winner::from_role);
        }
        if self.is_full() {
            return Some(Winner::Draw);
        }
        None
    }
}

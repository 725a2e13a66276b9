use liveworld_common::{Direction, Position};

/// A proximity cell: a `cell_size × cell_size` block of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Quantises tile positions into proximity cells and decides which map
/// edges a cell is close to.
///
/// Edge proximity is a function of the cell only, so interest only needs
/// recomputing when an avatar changes cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGrid {
    cell_size: i32,
    edge_radius: i32,
}

impl CellGrid {
    pub fn new(cell_size: i32, edge_radius: i32) -> Self {
        Self {
            cell_size: cell_size.max(1),
            edge_radius: edge_radius.max(0),
        }
    }

    pub fn cell_size(&self) -> i32 {
        self.cell_size
    }

    pub fn edge_radius(&self) -> i32 {
        self.edge_radius
    }

    pub fn cell_of(&self, pos: Position) -> CellCoord {
        CellCoord {
            x: pos.x.div_euclid(self.cell_size),
            y: pos.y.div_euclid(self.cell_size),
        }
    }

    /// Edges of a `width × height` map that some tile of `cell` lies within
    /// `edge_radius` tiles of.
    pub fn near_edges(&self, cell: CellCoord, width: u32, height: u32) -> Vec<Direction> {
        if self.edge_radius == 0 {
            return Vec::new();
        }
        let min_x = cell.x * self.cell_size;
        let min_y = cell.y * self.cell_size;
        let max_x = min_x + self.cell_size - 1;
        let max_y = min_y + self.cell_size - 1;
        let (w, h) = (width as i32, height as i32);

        let mut edges = Vec::new();
        if min_y < self.edge_radius {
            edges.push(Direction::North);
        }
        if max_x >= w - self.edge_radius {
            edges.push(Direction::East);
        }
        if max_y >= h - self.edge_radius {
            edges.push(Direction::South);
        }
        if min_x < self.edge_radius {
            edges.push(Direction::West);
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;

    #[test]
    fn cell_of_floors_negative_positions() {
        let grid = CellGrid::new(8, 2);
        assert_eq!(grid.cell_of(IVec2::new(7, 8)), CellCoord::new(0, 1));
        assert_eq!(grid.cell_of(IVec2::new(-1, 0)), CellCoord::new(-1, 0));
    }

    #[test]
    fn only_border_cells_are_near_edges() {
        let grid = CellGrid::new(4, 2);
        // 16x16 map: cells 0..=3 on each axis.
        assert_eq!(
            grid.near_edges(CellCoord::new(0, 0), 16, 16),
            vec![Direction::North, Direction::West]
        );
        assert!(grid.near_edges(CellCoord::new(1, 2), 16, 16).is_empty());
        assert_eq!(
            grid.near_edges(CellCoord::new(3, 1), 16, 16),
            vec![Direction::East]
        );
    }

    #[test]
    fn zero_radius_disables_edge_interest() {
        let grid = CellGrid::new(4, 0);
        assert!(grid.near_edges(CellCoord::new(0, 0), 4, 4).is_empty());
    }
}

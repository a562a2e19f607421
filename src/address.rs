use std::fmt;

use num_integer::Integer;

use crate::config::{BaseType, Geometry};

/// How many levels of an [`Address`] are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Depth {
    #[default]
    None,
    Package,
    Die,
    Plane,
    Block,
    Page,
}

/// Hierarchical flash location: package, die, plane, block, page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub package: BaseType,
    pub die: BaseType,
    pub plane: BaseType,
    pub block: BaseType,
    pub page: BaseType,
    pub valid: Depth,
}

impl Address {
    pub const INVALID: Address = Address {
        package: 0,
        die: 0,
        plane: 0,
        block: 0,
        page: 0,
        valid: Depth::None,
    };

    pub fn new(package: BaseType, die: BaseType, plane: BaseType, block: BaseType, page: BaseType, valid: Depth) -> Self {
        Address { package, die, plane, block, page, valid }
    }

    pub fn die_address(package: BaseType, die: BaseType) -> Self {
        Address { package, die, valid: Depth::Die, ..Address::INVALID }
    }

    /// Decodes a flat page number into a hierarchical address truncated to `valid`.
    pub fn from_linear(linear: BaseType, valid: Depth, geometry: &Geometry) -> Self {
        let mut address = Address::INVALID;
        address.set_linear_address(linear, valid, geometry);
        address
    }

    pub fn set_linear_address(&mut self, linear: BaseType, valid: Depth, geometry: &Geometry) {
        let (rest, page) = linear.div_rem(&geometry.pages_per_block);
        let (rest, block) = rest.div_rem(&geometry.blocks_per_plane);
        let (rest, plane) = rest.div_rem(&geometry.planes_per_die);
        let (package, die) = rest.div_rem(&geometry.dies_per_package);
        *self = Address { package, die, plane, block, page, valid };
        self.truncate(valid);
    }

    /// Mixed-radix encoding of the address; levels below `valid` count as zero.
    pub fn get_linear_address(&self, geometry: &Geometry) -> BaseType {
        let field = |depth: Depth, value: BaseType| if self.valid >= depth { value } else { 0 };
        let mut linear = field(Depth::Package, self.package);
        linear = linear * geometry.dies_per_package + field(Depth::Die, self.die);
        linear = linear * geometry.planes_per_die + field(Depth::Plane, self.plane);
        linear = linear * geometry.blocks_per_plane + field(Depth::Block, self.block);
        linear * geometry.pages_per_block + field(Depth::Page, self.page)
    }

    /// Flat index of the block this address falls in.
    pub fn block_index(&self, geometry: &Geometry) -> BaseType {
        self.block_address().get_linear_address(geometry) / geometry.pages_per_block
    }

    pub fn die_index(&self, geometry: &Geometry) -> BaseType {
        geometry.die_index(self.package, self.die)
    }

    /// Same location truncated to block depth.
    pub fn block_address(&self) -> Address {
        let mut address = *self;
        address.truncate(Depth::Block.min(self.valid));
        address
    }

    pub fn is_valid(&self) -> bool {
        self.valid != Depth::None
    }

    /// Deepest level at which both addresses are meaningful and agree.
    pub fn compare(&self, other: &Address) -> Depth {
        let deepest = self.valid.min(other.valid);
        let levels = [
            (Depth::Package, self.package == other.package),
            (Depth::Die, self.die == other.die),
            (Depth::Plane, self.plane == other.plane),
            (Depth::Block, self.block == other.block),
            (Depth::Page, self.page == other.page),
        ];
        let mut matched = Depth::None;
        for (depth, equal) in levels {
            if depth > deepest || !equal {
                break;
            }
            matched = depth;
        }
        matched
    }

    fn truncate(&mut self, valid: Depth) {
        if valid < Depth::Package {
            self.package = 0;
        }
        if valid < Depth::Die {
            self.die = 0;
        }
        if valid < Depth::Plane {
            self.plane = 0;
        }
        if valid < Depth::Block {
            self.block = 0;
        }
        if valid < Depth::Page {
            self.page = 0;
        }
        self.valid = valid;
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "(invalid)");
        }
        let fields = [self.package, self.die, self.plane, self.block, self.page];
        let shown = self.valid as usize;
        write!(f, "(")?;
        for (i, value) in fields.iter().take(shown).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

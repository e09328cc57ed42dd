use bitflags::bitflags;

bitflags! {
    /// Guest RFLAGS, using the architectural bit positions.
    ///
    /// Only CF/ZF/SF/OF/DF are produced or consumed by translated code; the remaining bits are
    /// carried so register dumps look familiar.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Rflags: u64 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

impl Default for Rflags {
    fn default() -> Self {
        // Bit 1 always reads as set on real hardware.
        Rflags::RESERVED1
    }
}

impl Rflags {
    /// Replace the arithmetic status bits (ZF/SF/CF/OF), leaving control bits untouched.
    pub fn set_status(&mut self, zf: bool, sf: bool, cf: bool, of: bool) {
        self.set(Rflags::ZF, zf);
        self.set(Rflags::SF, sf);
        self.set(Rflags::CF, cf);
        self.set(Rflags::OF, of);
    }

    /// Short textual form used by register dumps, e.g. `ZF SF`.
    pub fn describe(&self) -> String {
        const NAMES: [(Rflags, &str); 6] = [
            (Rflags::CF, "CF"),
            (Rflags::ZF, "ZF"),
            (Rflags::SF, "SF"),
            (Rflags::OF, "OF"),
            (Rflags::DF, "DF"),
            (Rflags::IF, "IF"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            "-".to_string()
        } else {
            set.join(" ")
        }
    }
}

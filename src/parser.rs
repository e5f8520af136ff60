//! Parser for accelerator assembly lines
//!
//! Parses lines like:
//! - `WRF IB0`
//! - `WRF MRF0 DataFile`
//! - `GLMV CSD_3 AddrFile DataFile`
//! - `VFUX ADD SW12 R0 R1R2`
//! - `LOOP 0 17 64`

use std::fmt;
use std::str::FromStr;

use crate::error::{CompileError, CompileResult};
use crate::hardware::{ladder_index, RegFile, VWR_COUNT};
use crate::isa::{
    AddrOperand, ComputeFields, DataOperand, Instruction, LoopRegister, MacroInstr, MoveFields, Opcode,
    PackFields, RepackKind, StorageClass,
};
use crate::lexer::{Lexer, Token};

/// Mnemonics accepted at the start of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Wrf,
    Nop,
    Loop,
    Rlb,
    Wlb,
    Vmv,
    Rmv,
    Glmv,
    Pack,
    Perm,
    Vfux,
    Exec,
}

impl FromStr for Mnemonic {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WRF" => Ok(Mnemonic::Wrf),
            "NOP" => Ok(Mnemonic::Nop),
            "LOOP" => Ok(Mnemonic::Loop),
            "RLB" => Ok(Mnemonic::Rlb),
            "WLB" => Ok(Mnemonic::Wlb),
            "VMV" => Ok(Mnemonic::Vmv),
            "RMV" => Ok(Mnemonic::Rmv),
            "GLMV" => Ok(Mnemonic::Glmv),
            "PACK" => Ok(Mnemonic::Pack),
            "PERM" => Ok(Mnemonic::Perm),
            "VFUX" => Ok(Mnemonic::Vfux),
            "EXEC" => Ok(Mnemonic::Exec),
            _ => Err(()),
        }
    }
}

/// One parsed assembly line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `WRF <file><index> [values]`; instruction-buffer targets carry no values
    Wrf {
        target: RegFile,
        index: usize,
        values: Option<DataOperand>,
    },
    Loop(LoopRegister),
    Exec,
    Instr(Instruction),
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Wrf { target, index, values } => {
                write!(f, "WRF {}{}", target.prefix(), index)?;
                if let Some(values) = values {
                    write!(f, " {}", values)?;
                }
                Ok(())
            }
            Statement::Loop(lr) => write!(f, "{}", lr),
            Statement::Exec => write!(f, "EXEC"),
            Statement::Instr(instr) => write!(f, "{}", instr),
        }
    }
}

/// Split a storage token into class prefix and the text after it.
///
/// The prefix ends at the first digit, `_` or `[`; a `_` delimiter is
/// dropped from the remainder.
pub fn split_class(token: &str) -> (&str, &str) {
    match token.find(|c: char| c.is_ascii_digit() || c == '_' || c == '[') {
        Some(at) => {
            let rest = &token[at..];
            (&token[..at], rest.strip_prefix('_').unwrap_or(rest))
        }
        None => (token, ""),
    }
}

/// Split `3[12]` into `("3", Some("12"))`
fn split_index(rest: &str) -> Option<(&str, Option<&str>)> {
    match rest.find('[') {
        Some(open) => {
            let inner = rest[open + 1..].strip_suffix(']')?;
            Some((&rest[..open], Some(inner)))
        }
        None => Some((rest, None)),
    }
}

/// Parse a single line; blank and comment-only lines give `None`
pub fn parse_line(line: usize, text: &str) -> CompileResult<Option<Statement>> {
    let tokens = Lexer::new(text).tokenize().map_err(|e| {
        CompileError::grammar(line, format!("unexpected '{}' at column {}", e.text, e.column + 1))
    })?;
    if tokens.is_empty() {
        return Ok(None);
    }
    LineParser::new(line, &tokens).parse().map(Some)
}

/// Parser over the tokens of one line
struct LineParser<'a> {
    line: usize,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> LineParser<'a> {
    fn new(line: usize, tokens: &'a [Token]) -> Self {
        Self { line, tokens, pos: 0 }
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::grammar(self.line, msg)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }

    fn expect_word(&mut self, what: &str) -> CompileResult<&'a str> {
        match self.advance() {
            Some(Token::Word(w)) => Ok(w.as_str()),
            Some(other) => Err(self.error(format!("expected {}, got '{}'", what, other))),
            None => Err(self.error(format!("missing {}", what))),
        }
    }

    fn expect_number(&mut self, what: &str) -> CompileResult<u64> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(*n),
            Some(other) => Err(self.error(format!("expected {}, got '{}'", what, other))),
            None => Err(self.error(format!("missing {}", what))),
        }
    }

    fn expect_end(&self, mnemonic: &str) -> CompileResult<()> {
        if self.remaining() > 0 {
            return Err(self.error(format!(
                "{} takes fewer operands ({} extra)",
                mnemonic,
                self.remaining()
            )));
        }
        Ok(())
    }

    fn parse(mut self) -> CompileResult<Statement> {
        let head = self.expect_word("mnemonic")?;
        let mnemonic = head.parse::<Mnemonic>().map_err(|_| CompileError::UnknownMnemonic {
            line: self.line,
            mnemonic: head.to_string(),
        })?;

        let stmt = match mnemonic {
            Mnemonic::Wrf => self.parse_wrf()?,
            Mnemonic::Loop => {
                let start = self.expect_number("loop start")? as usize;
                let end = self.expect_number("loop end")? as usize;
                let iterations = self.expect_number("loop iterations")?;
                Statement::Loop(LoopRegister::new(start, end, iterations))
            }
            Mnemonic::Exec => Statement::Exec,
            Mnemonic::Nop => self.parse_nop()?,
            Mnemonic::Rlb => {
                let vwr = self.vwr_operand()?;
                let addr = self.addr_operand()?;
                Statement::Instr(Instruction::new(MacroInstr::rlb(vwr)).with_addr(addr))
            }
            Mnemonic::Wlb => {
                let vwr = self.vwr_operand()?;
                let addr = self.addr_operand()?;
                Statement::Instr(Instruction::new(MacroInstr::wlb(vwr)).with_addr(addr))
            }
            Mnemonic::Glmv => {
                let csd = self.csd_operand()?;
                let addr = self.addr_operand()?;
                let data = self.data_operand()?;
                Statement::Instr(
                    Instruction::new(MacroInstr::glmv(csd))
                        .with_addr(addr)
                        .with_data(data),
                )
            }
            Mnemonic::Vmv => self.parse_vmv()?,
            Mnemonic::Rmv => {
                let dst = self.register_operand()?;
                let src = self.register_operand()?;
                let shift = if self.remaining() > 0 {
                    self.expect_number("shift")? as u32
                } else {
                    0
                };
                Statement::Instr(MacroInstr::rmv(dst, src, shift).into())
            }
            Mnemonic::Perm => {
                let vwr = self.vwr_operand()?;
                let pattern = self.expect_number("permutation pattern")? as u32;
                Statement::Instr(MacroInstr::perm(vwr, pattern).into())
            }
            Mnemonic::Pack => self.parse_pack()?,
            Mnemonic::Vfux => self.parse_vfux()?,
        };

        self.expect_end(head)?;
        Ok(stmt)
    }

    fn parse_wrf(&mut self) -> CompileResult<Statement> {
        let token = self.expect_word("register file")?;
        let (class, rest) = split_class(token);
        let target = RegFile::from_prefix(class)
            .ok_or_else(|| CompileError::unresolved(self.line, token))?;
        let index = rest
            .parse::<usize>()
            .map_err(|_| CompileError::unresolved(self.line, token))?;

        let values = if target == RegFile::InstrBuffer || self.remaining() == 0 {
            None
        } else {
            Some(self.data_operand()?)
        };
        if target != RegFile::InstrBuffer && values.is_none() {
            return Err(self.error(format!("WRF {} needs a value", token)));
        }
        Ok(Statement::Wrf { target, index, values })
    }

    fn parse_nop(&mut self) -> CompileResult<Statement> {
        if self.remaining() == 0 {
            return Ok(Statement::Instr(MacroInstr::nop().into()));
        }
        match self.expect_word("EXIT")? {
            "EXIT" => Ok(Statement::Instr(MacroInstr::exit().into())),
            other => Err(self.error(format!("NOP accepts only EXIT, got '{}'", other))),
        }
    }

    fn parse_vmv(&mut self) -> CompileResult<Statement> {
        let (dst, dst_idx) = self.storage_operand()?;
        let (src, src_idx) = self.storage_operand()?;
        let imm = match (dst.is_vwr(), src.is_vwr()) {
            (true, false) => dst_idx,
            (false, true) => src_idx,
            _ => return Err(self.error("VMV moves between one VWR word and one register")),
        };
        let imm = imm.ok_or_else(|| self.error("VMV needs a VWR word index"))?;
        if matches!(dst, StorageClass::R1R2) || matches!(src, StorageClass::R1R2) {
            return Err(self.error("VMV cannot address the R1R2 pair"));
        }
        Ok(Statement::Instr(
            MacroInstr::Move(MoveFields {
                opcode: Opcode::Vmv,
                imm,
                dst,
                src,
            })
            .into(),
        ))
    }

    fn parse_pack(&mut self) -> CompileResult<Statement> {
        let token = self.expect_word("repack selector")?;
        let repack = parse_repack(token).ok_or_else(|| CompileError::unresolved(self.line, token))?;
        let offset = self.expect_number("pack offset")? as u32;
        let (dst, dst_idx) = self.storage_operand()?;
        if !dst.is_vwr() {
            return Err(self.error("PACK writes a VWR word"));
        }
        Ok(Statement::Instr(
            MacroInstr::Pack(PackFields {
                repack,
                offset,
                dst_idx: dst_idx.unwrap_or(0),
                dst,
            })
            .into(),
        ))
    }

    fn parse_vfux(&mut self) -> CompileResult<Statement> {
        let name = self.expect_word("VFUX operation")?;
        let opcode = Opcode::from_vfu_name(name).ok_or_else(|| CompileError::UnknownMnemonic {
            line: self.line,
            mnemonic: format!("VFUX {}", name),
        })?;
        let token = self.expect_word("subword width")?;
        let subword = match split_class(token) {
            ("SW", digits) => digits.parse::<u32>().ok().filter(|w| ladder_index(*w).is_some()),
            _ => None,
        };
        let subword = subword.ok_or_else(|| CompileError::unresolved(self.line, token))?;

        let (dst, dst_idx) = self.storage_operand()?;
        let (src, src_idx) = self.storage_operand()?;
        let csd = match opcode {
            Opcode::Mul => self.csd_operand()?,
            Opcode::Shl | Opcode::Shr => self.expect_number("shift amount")? as u32,
            _ => 0,
        };
        Ok(Statement::Instr(
            MacroInstr::Compute(ComputeFields {
                opcode,
                subword,
                csd,
                dst_idx: dst_idx.unwrap_or(0),
                src_idx: src_idx.unwrap_or(0),
                dst,
                src,
            })
            .into(),
        ))
    }

    /// Storage token with an optional word index
    fn storage_operand(&mut self) -> CompileResult<(StorageClass, Option<u32>)> {
        let token = self.expect_word("storage operand")?;
        resolve_storage(token).ok_or_else(|| CompileError::unresolved(self.line, token))
    }

    fn register_operand(&mut self) -> CompileResult<StorageClass> {
        let token = self.expect_word("register")?;
        match resolve_storage(token) {
            Some((class, None)) if !class.is_vwr() => Ok(class),
            _ => Err(CompileError::unresolved(self.line, token)),
        }
    }

    fn vwr_operand(&mut self) -> CompileResult<u8> {
        let token = self.expect_word("VWR")?;
        match resolve_storage(token) {
            Some((StorageClass::Vwr(v), None)) => Ok(v),
            _ => Err(CompileError::unresolved(self.line, token)),
        }
    }

    fn csd_operand(&mut self) -> CompileResult<u32> {
        let token = self.expect_word("CSD entry")?;
        let entry = match split_class(token) {
            ("CSD", digits) => digits.parse::<u32>().ok(),
            _ => None,
        };
        entry.ok_or_else(|| CompileError::unresolved(self.line, token))
    }

    fn addr_operand(&mut self) -> CompileResult<AddrOperand> {
        match self.advance() {
            Some(Token::Word(w)) if w == "AddrFile" => Ok(AddrOperand::File),
            Some(Token::Number(n)) => Ok(AddrOperand::Literal(*n)),
            Some(other) => Err(CompileError::unresolved(self.line, other.to_string())),
            None => Err(self.error("missing address operand")),
        }
    }

    /// `DataFile` or every remaining numeric token
    fn data_operand(&mut self) -> CompileResult<DataOperand> {
        match self.tokens.get(self.pos) {
            Some(Token::Word(w)) if w == "DataFile" => {
                self.pos += 1;
                Ok(DataOperand::File)
            }
            Some(Token::Number(_)) => {
                let mut words = Vec::new();
                while let Some(Token::Number(n)) = self.tokens.get(self.pos) {
                    words.push(*n);
                    self.pos += 1;
                }
                Ok(DataOperand::Literal(words))
            }
            Some(other) => Err(CompileError::unresolved(self.line, other.to_string())),
            None => Err(self.error("missing data operand")),
        }
    }
}

/// Resolve `R0`..`R3`, `R1R2` and `VWR_<v>[<w>]`
pub fn resolve_storage(token: &str) -> Option<(StorageClass, Option<u32>)> {
    if token == "R1R2" {
        return Some((StorageClass::R1R2, None));
    }
    let (class, rest) = split_class(token);
    let (sub, index) = split_index(rest)?;
    let index = match index {
        Some(text) => Some(text.parse::<u32>().ok()?),
        None => None,
    };
    match class {
        "R" if index.is_none() => match sub {
            "0" => Some((StorageClass::R0, None)),
            "1" => Some((StorageClass::R1, None)),
            "2" => Some((StorageClass::R2, None)),
            "3" => Some((StorageClass::R3, None)),
            _ => None,
        },
        "VWR" => {
            let v = sub.parse::<usize>().ok().filter(|v| *v < VWR_COUNT)?;
            Some((StorageClass::Vwr(v as u8), index))
        }
        _ => None,
    }
}

/// Resolve `PK<from>TO<to>` against the adjacency table
pub fn parse_repack(token: &str) -> Option<RepackKind> {
    let body = token.strip_prefix("PK")?;
    let (from, to) = body.split_once("TO")?;
    RepackKind::between(from.parse().ok()?, to.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> Statement {
        parse_line(1, text).unwrap().unwrap()
    }

    #[test]
    fn test_split_class() {
        assert_eq!(split_class("VWR_0[5]"), ("VWR", "0[5]"));
        assert_eq!(split_class("IB12"), ("IB", "12"));
        assert_eq!(split_class("CSD_3"), ("CSD", "3"));
        assert_eq!(split_class("R1R2"), ("R", "1R2"));
        assert_eq!(split_class("EXIT"), ("EXIT", ""));
    }

    #[test]
    fn test_resolve_storage() {
        assert_eq!(resolve_storage("VWR_1[7]"), Some((StorageClass::Vwr(1), Some(7))));
        assert_eq!(resolve_storage("VWR_0"), Some((StorageClass::Vwr(0), None)));
        assert_eq!(resolve_storage("R3"), Some((StorageClass::R3, None)));
        assert_eq!(resolve_storage("R1R2"), Some((StorageClass::R1R2, None)));
        assert_eq!(resolve_storage("R4"), None);
        assert_eq!(resolve_storage("VWR_2[0]"), None);
        assert_eq!(resolve_storage("VWR_0[x]"), None);
        assert_eq!(resolve_storage("Q0"), None);
    }

    #[test]
    fn test_wrf_forms() {
        assert_eq!(
            parse("WRF IB3"),
            Statement::Wrf {
                target: RegFile::InstrBuffer,
                index: 3,
                values: None
            }
        );
        assert_eq!(
            parse("WRF MRF0 DataFile"),
            Statement::Wrf {
                target: RegFile::Mask,
                index: 0,
                values: Some(DataOperand::File)
            }
        );
        assert_eq!(
            parse("WRF SRF1 0x10 2"),
            Statement::Wrf {
                target: RegFile::Scalar,
                index: 1,
                values: Some(DataOperand::Literal(vec![16, 2]))
            }
        );
        assert!(parse_line(4, "WRF SRF1").is_err());
        assert!(matches!(
            parse_line(4, "WRF XRF1 3"),
            Err(CompileError::UnresolvedOperand { line: 4, .. })
        ));
    }

    #[test]
    fn test_unknown_mnemonic() {
        match parse_line(7, "JMP 3") {
            Err(CompileError::UnknownMnemonic { line, mnemonic }) => {
                assert_eq!(line, 7);
                assert_eq!(mnemonic, "JMP");
            }
            other => panic!("expected unknown mnemonic, got {:?}", other),
        }
        assert!(matches!(
            parse_line(2, "VFUX DIV SW8 R0 R1R2"),
            Err(CompileError::UnknownMnemonic { .. })
        ));
    }

    #[test]
    fn test_operand_counts() {
        assert!(parse_line(1, "EXEC now").is_err());
        assert!(parse_line(1, "LOOP 0 3").is_err());
        assert!(parse_line(1, "RLB VWR_0").is_err());
        assert!(parse_line(1, "VMV R0 R1").is_err());
        assert!(parse_line(1, "VFUX ADD SW7 R0 R1R2").is_err());
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert_eq!(parse_line(1, "").unwrap(), None);
        assert_eq!(parse_line(1, "  ; pass 0").unwrap(), None);
    }

    #[test]
    fn test_text_round_trip() {
        let lines = [
            "WRF IB0",
            "WRF DLEN0 0x8",
            "LOOP 0 12 6",
            "EXEC",
            "NOP",
            "NOP EXIT",
            "RLB VWR_1 AddrFile",
            "WLB VWR_0 0x4000",
            "GLMV CSD_2 AddrFile DataFile",
            "GLMV CSD_2 0x80 0x1 0x2",
            "VMV R1 VWR_0[3]",
            "VMV VWR_1[9] R0",
            "RMV R3 R0 2",
            "PERM VWR_0 1",
            "PACK PK8TO12 4 VWR_1[3]",
            "VFUX MUL SW8 VWR_0[2] VWR_0[2] CSD_3",
            "VFUX ADD SW12 R0 R1R2",
            "VFUX SHR SW16 R0 R0 2",
        ];
        for text in lines {
            assert_eq!(parse(text).to_string(), text);
        }
    }
}

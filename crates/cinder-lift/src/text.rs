//! A plain-text rendering of the lifted tree, used for disassembly-style
//! output and for keeping tests readable.

use crate::node::{AstNode, AstVisitor, DataType, FlagBit, Operator, RepKind};

const REG8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
const REG16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
const REG32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const SEGMENTS: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];

pub fn type_name(ty: DataType) -> String {
    if ty == DataType::BOOL {
        "bool".into()
    } else {
        format!("{}{}", if ty.signed { "i" } else { "u" }, ty.bits)
    }
}

pub fn register_name(ty: DataType, index: u8) -> &'static str {
    let index = index as usize & 7;
    match ty.bits {
        8 => REG8[index],
        32 => REG32[index],
        _ => REG16[index],
    }
}

pub fn segment_name(index: u8) -> &'static str {
    SEGMENTS[index as usize % SEGMENTS.len()]
}

/// Renders every node to a string; `AstVisitor` keeps it total over the
/// node set.
#[derive(Default)]
pub struct AstPrinter;

impl AstPrinter {
    pub fn print(&mut self, node: &AstNode) -> String {
        node.accept(self)
    }
}

impl AstVisitor for AstPrinter {
    type Output = String;

    fn visit_constant(&mut self, ty: DataType, value: u64) -> String {
        if ty.signed {
            let shift = 64 - ty.bits as u32;
            let signed = ((value << shift) as i64) >> shift;
            if signed < 0 {
                return format!("-0x{:X}", -signed);
            }
        }
        format!("0x{value:X}")
    }

    fn visit_segmented_address_constant(&mut self, segment: u16, offset: u16) -> String {
        format!("{segment:04X}:{offset:04X}")
    }

    fn visit_register(&mut self, ty: DataType, index: u8) -> String {
        register_name(ty, index).into()
    }

    fn visit_segment_register(&mut self, index: u8) -> String {
        segment_name(index).into()
    }

    fn visit_cpu_flag(&mut self, flag: FlagBit) -> String {
        flag.name().into()
    }

    fn visit_absolute_pointer(&mut self, ty: DataType, address: &AstNode) -> String {
        format!("mem{}[{}]", ty.bits, address.accept(self))
    }

    fn visit_segmented_pointer(
        &mut self,
        _ty: DataType,
        segment: &AstNode,
        default_segment: Option<u8>,
        offset: &AstNode,
    ) -> String {
        let offset = offset.accept(self);
        // Omit the segment prefix when it is the one the encoding implies.
        if let (AstNode::SegmentRegister { index }, Some(default)) = (segment, default_segment) {
            if *index == default {
                return format!("[{offset}]");
            }
        }
        format!("{}:[{offset}]", segment.accept(self))
    }

    fn visit_binary(&mut self, _ty: DataType, lhs: &AstNode, op: Operator, rhs: &AstNode) -> String {
        if op == Operator::Assign {
            format!("{} = {}", lhs.accept(self), rhs.accept(self))
        } else {
            format!("({} {} {})", lhs.accept(self), op.symbol(), rhs.accept(self))
        }
    }

    fn visit_unary(&mut self, _ty: DataType, op: Operator, operand: &AstNode) -> String {
        format!("{}{}", op.symbol(), operand.accept(self))
    }

    fn visit_type_conversion(&mut self, ty: DataType, value: &AstNode) -> String {
        format!("({})({})", type_name(ty), value.accept(self))
    }

    fn visit_method_call(
        &mut self,
        _ty: DataType,
        receiver: &str,
        method: &str,
        args: &[AstNode],
    ) -> String {
        let args: Vec<String> = args.iter().map(|arg| arg.accept(self)).collect();
        format!("{receiver}.{method}({})", args.join(", "))
    }

    fn visit_variable_declaration(
        &mut self,
        ty: DataType,
        name: &str,
        initializer: Option<&AstNode>,
    ) -> String {
        match initializer {
            Some(init) => format!("{} {name} = {}", type_name(ty), init.accept(self)),
            None => format!("{} {name}", type_name(ty)),
        }
    }

    fn visit_variable_reference(&mut self, _ty: DataType, name: &str) -> String {
        name.into()
    }

    fn visit_block(&mut self, statements: &[AstNode]) -> String {
        let rendered: Vec<String> = statements.iter().map(|s| s.accept(self)).collect();
        rendered.join("; ")
    }

    fn visit_move_ip_next(&mut self, offset: &AstNode) -> String {
        format!("ip = {}", offset.accept(self))
    }

    fn visit_instruction(
        &mut self,
        mnemonic: &str,
        operands: &[AstNode],
        rep: Option<RepKind>,
    ) -> String {
        let prefix = match rep {
            Some(RepKind::Always) => "rep ",
            Some(RepKind::WhileZero) => "repe ",
            Some(RepKind::WhileNotZero) => "repne ",
            None => "",
        };
        if operands.is_empty() {
            return format!("{prefix}{mnemonic}");
        }
        let rendered: Vec<String> = operands.iter().map(|o| o.accept(self)).collect();
        format!("{prefix}{mnemonic} {}", rendered.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build;
    use cinder_cpu::state::{reg, seg};

    #[test]
    fn renders_registers_by_width() {
        let mut printer = AstPrinter;
        assert_eq!(printer.print(&build::register(DataType::U8, 4)), "ah");
        assert_eq!(printer.print(&build::register(DataType::U16, reg::SI)), "si");
        assert_eq!(printer.print(&build::register(DataType::U32, reg::AX)), "eax");
    }

    #[test]
    fn omits_redundant_segment_prefix() {
        let mut printer = AstPrinter;
        let pointer = build::segmented_pointer(
            DataType::U16,
            build::segment_register(seg::DS),
            Some(seg::DS),
            build::register(DataType::U16, reg::BX),
        );
        assert_eq!(printer.print(&pointer), "[bx]");

        let overridden = build::segmented_pointer(
            DataType::U16,
            build::segment_register(seg::ES),
            Some(seg::DS),
            build::register(DataType::U16, reg::BX),
        );
        assert_eq!(printer.print(&overridden), "es:[bx]");
    }

    #[test]
    fn renders_signed_constants_with_sign() {
        let mut printer = AstPrinter;
        assert_eq!(printer.print(&build::signed_constant(DataType::I8, -16)), "-0x10");
        assert_eq!(printer.print(&build::constant(DataType::U16, 0x1234)), "0x1234");
    }

    #[test]
    fn renders_instruction_with_rep_prefix() {
        let mut printer = AstPrinter;
        let node = build::instruction_node(
            "movsb",
            vec![],
            Some(RepKind::Always),
        );
        assert_eq!(printer.print(&node), "rep movsb");
    }
}

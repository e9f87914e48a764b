//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaMap;
use crate::ir::{
    CondKind, DeclareTable, InstData, Label, LabelData, Operand, RegBase, RegOperand, SrcModifier,
};
use std::fmt;

/// Formats an instruction in a vISA-like assembly syntax for log output.
pub struct InstDisplay<'a> {
    inst: &'a InstData,
    decls: &'a DeclareTable,
    labels: &'a ArenaMap<Label, LabelData>,
}

impl<'a> InstDisplay<'a> {
    pub(crate) fn new(
        inst: &'a InstData,
        decls: &'a DeclareTable,
        labels: &'a ArenaMap<Label, LabelData>,
    ) -> Self {
        Self {
            inst,
            decls,
            labels,
        }
    }

    fn reg(&self, f: &mut fmt::Formatter<'_>, op: &RegOperand, is_dst: bool) -> fmt::Result {
        match op.modifier {
            SrcModifier::None => {}
            SrcModifier::Neg => f.write_str("-")?,
            SrcModifier::Abs => f.write_str("(abs)")?,
            SrcModifier::NegAbs => f.write_str("-(abs)")?,
            SrcModifier::Not => f.write_str("~")?,
        }

        match op.base {
            RegBase::Var(d) => write!(f, "{}({},{})", self.decls[d].name, op.row, op.sub_reg)?,
            RegBase::Indirect { addr, imm } => {
                write!(f, "r[{}(0,{}),{}]", self.decls[addr].name, op.sub_reg, imm)?
            }
            RegBase::Acc(n) => write!(f, "acc{n}")?,
            RegBase::Null => return write!(f, "null:{}", op.ty),
        }

        if is_dst {
            write!(f, "<{}>:{}", op.region.hstride, op.ty)
        } else {
            write!(f, "{}:{}", op.region, op.ty)
        }
    }
}

impl<'a> fmt::Display for InstDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inst = self.inst;

        if let Some(pred) = inst.pred {
            let sign = if pred.inverse { "!" } else { "" };

            write!(f, "({}{}) ", sign, self.decls[pred.flag].name)?;
        }

        write!(f, "{}", inst.op.mnemonic())?;

        if inst.sat {
            f.write_str(".sat")?;
        }

        if let Some(cm) = inst.cond_mod {
            let kind = match cm.kind {
                CondKind::Eq => "eq",
                CondKind::Ne => "ne",
                CondKind::Gt => "gt",
                CondKind::Ge => "ge",
                CondKind::Lt => "lt",
                CondKind::Le => "le",
                CondKind::Ov => "ov",
            };

            write!(f, ".{}.{}", kind, self.decls[cm.flag].name)?;
        }

        write!(f, " ({}|M{})", inst.exec_size, inst.mask_offset)?;

        if inst.no_mask {
            f.write_str(" NoMask")?;
        }

        if let Some(label) = inst.target {
            write!(f, " {}", self.labels[label].name)?;
        }

        if !inst.dst.is_null() || !inst.srcs.is_empty() {
            f.write_str(" ")?;
            self.reg(f, &inst.dst, true)?;
        }

        for src in inst.srcs.iter() {
            f.write_str(" ")?;

            match src {
                Operand::Reg(r) => self.reg(f, r, false)?,
                Operand::Imm { bits, ty } => write!(f, "0x{bits:x}:{ty}")?,
                Operand::AddrOf { var, offset } => {
                    write!(f, "&{}[{}]", self.decls[*var].name, offset)?
                }
            }
        }

        if let Some(send) = inst.send {
            write!(
                f,
                " {:?} mlen={} rlen={} desc=0x{:x}{}",
                send.sfid,
                send.msg_len,
                send.resp_len,
                send.desc,
                if send.eot { " EOT" } else { "" }
            )?;
        }

        Ok(())
    }
}

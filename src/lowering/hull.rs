//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::ir::{
    Declare, DeclareData, ElemType, Inst, InstData, IntrinsicOp, Kernel, Opcode, Operand, RegBase,
    RegFile, RegOperand, Region, SendDesc, Sfid, SrcModifier, SubRegAlign,
};
use crate::target::GRF_BYTES;
use log::{debug, trace};

/// Descriptor bit of a URB read. Writes leave it clear.
pub const URB_READ: u32 = 1;

/// Descriptor bit telling the URB to take per-channel offsets from the
/// second payload row instead of from the descriptor.
pub const URB_PER_SLOT_OFFSET: u32 = 1 << 17;

/// Position of the global offset inside of the descriptor. Offsets count
/// 16-byte URB slots.
pub const URB_OFFSET_SHIFT: u32 = 4;

const URB_MAX_OFFSET: u32 = 0x7ff;

/// How hull-shader threads are dispatched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HsDispatch {
    /// One patch per thread, channels compute output control points.
    SingleInstance,
    /// Eight patches per thread, one per channel.
    EightPatch,
}

/// The shape of the hull shader being lowered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HullShaderInfo {
    /// Dispatch mode.
    pub dispatch: HsDispatch,
    /// Control points per input patch.
    pub input_vertices: u32,
    /// Control points per output patch.
    pub output_vertices: u32,
    /// Distance between two output control points, in URB slots.
    pub vertex_stride: u32,
}

impl HullShaderInfo {
    // bytes of URB handles per control point
    fn handle_bytes(&self) -> u32 {
        match self.dispatch {
            HsDispatch::SingleInstance => 4,
            HsDispatch::EightPatch => GRF_BYTES,
        }
    }

    fn handle_region(&self) -> Region {
        match self.dispatch {
            HsDispatch::SingleInstance => Region::scalar(),
            HsDispatch::EightPatch => Region::contiguous(8),
        }
    }
}

#[derive(Copy, Clone)]
enum UrbOffset {
    Global(u32),
    PerSlot(Operand),
}

fn urb_desc(read: bool, offset: &UrbOffset) -> u32 {
    let op = if read { URB_READ } else { 0 };

    match offset {
        UrbOffset::Global(slots) => {
            assert!(*slots <= URB_MAX_OFFSET, "URB offset {slots} does not fit");

            op | (slots << URB_OFFSET_SHIFT)
        }
        UrbOffset::PerSlot(_) => op | URB_PER_SLOT_OFFSET,
    }
}

fn const_index(op: &Operand, what: &str) -> u32 {
    match op {
        Operand::Imm { bits, .. } => *bits as u32,
        other => panic!("{what} index must be a constant, got {other:?}"),
    }
}

// rows covered by `exec_size` elements of `ty`
fn rows_for(exec_size: u8, ty: ElemType) -> u32 {
    let bytes = u32::from(exec_size) * ty.size();

    ((bytes + GRF_BYTES - 1) / GRF_BYTES).max(1)
}

/// Lowers `hs_input_read` and `hs_output_write` into URB sends.
///
/// Every input control point has its own URB handle, attributes are
/// addressed by the global offset. The output patch shares one handle and
/// its control points are `vertex_stride` slots apart, so a dynamic output
/// index becomes per-slot offsets computed at runtime. A dynamic input
/// index selects its handle through an address register.
///
/// The handles arrive in the thread payload, in the two input declares
/// [`Self::input_handles`] and [`Self::output_handles`].
pub struct HullShaderLowering<'k> {
    kernel: &'k mut Kernel,
    info: HullShaderInfo,
    inputs: Declare,
    output: Declare,
}

impl<'k> HullShaderLowering<'k> {
    /// Prepares to lower `kernel`, which must already have its flowgraph.
    pub fn new(kernel: &'k mut Kernel, info: HullShaderInfo) -> Self {
        assert!(
            (1..=32).contains(&info.input_vertices),
            "{} input control points",
            info.input_vertices
        );
        assert!(
            (1..=32).contains(&info.output_vertices),
            "{} output control points",
            info.output_vertices
        );
        assert!(info.vertex_stride > 0, "output control points need a stride");

        let per_vertex = info.handle_bytes() / 4;
        let inputs = Self::handles(kernel, "HS_INPUT_HANDLES", per_vertex * info.input_vertices);
        let output = Self::handles(kernel, "HS_OUTPUT_HANDLES", per_vertex);

        Self {
            kernel,
            info,
            inputs,
            output,
        }
    }

    fn handles(kernel: &mut Kernel, name: &str, elems: u32) -> Declare {
        let mut data = DeclareData::grf(name, ElemType::UD, elems);

        data.is_input = true;
        data.sub_align = SubRegAlign::Grf;

        kernel.create_decl(data)
    }

    /// The declare holding the URB handles of the input control points.
    pub fn input_handles(&self) -> Declare {
        self.inputs
    }

    /// The declare holding the URB handle of the output patch.
    pub fn output_handles(&self) -> Declare {
        self.output
    }

    /// Lowers every hull-shader intrinsic, returns how many there were.
    pub fn run(&mut self) -> usize {
        let mut lowered = 0;

        for block in self.kernel.fg.order.clone() {
            let mut i = 0;

            while i < self.kernel.fg.blocks[block].insts.len() {
                let inst = self.kernel.fg.blocks[block].insts[i];
                let data = self.kernel.insts[inst].clone();

                let seq = match data.op {
                    Opcode::Intrinsic(IntrinsicOp::HsInputRead) => self.lower_input_read(&data),
                    Opcode::Intrinsic(IntrinsicOp::HsOutputWrite) => self.lower_output_write(&data),
                    _ => {
                        i += 1;
                        continue;
                    }
                };

                trace!("{} becomes {} instructions", self.kernel.display_inst(inst), seq.len());

                let n = seq.len();
                let insts: Vec<Inst> = seq
                    .into_iter()
                    .map(|data| self.kernel.create_inst(data))
                    .collect();

                self.kernel.fg.blocks[block].insts.splice(i..=i, insts);
                self.kernel.fg.blocks[block].has_send = true;

                i += n;
                lowered += 1;
            }
        }

        if lowered > 0 {
            // the handles are new inputs
            self.kernel
                .fg
                .compute_global_operands(&self.kernel.insts, &self.kernel.decls);
            self.kernel.renumber();
        }

        debug!("lowered {lowered} hull shader intrinsics in '{}'", self.kernel.name);

        lowered
    }

    fn payload(&mut self, rows: u32) -> Declare {
        let payload = self.kernel.create_temp(ElemType::UD, rows * GRF_BYTES / 4);

        self.kernel.decls[payload].sub_align = SubRegAlign::Grf;

        payload
    }

    // the first payload row, one handle per slot
    fn header(payload: Declare, handle: Operand) -> InstData {
        InstData::new(Opcode::Mov, 8)
            .with_dst(RegOperand::dst(payload, ElemType::UD))
            .with_src(handle)
            .with_no_mask()
    }

    fn input_handle(&mut self, vertex: Operand, seq: &mut Vec<InstData>) -> Operand {
        let per_vertex = self.info.handle_bytes();
        let region = self.info.handle_region();

        match vertex {
            Operand::Imm { bits, .. } => {
                let v = bits as u32;

                assert!(
                    v < self.info.input_vertices,
                    "input control point {v} out of range"
                );

                let byte = v * per_vertex;

                RegOperand::src(self.inputs, ElemType::UD, region)
                    .at((byte / GRF_BYTES) as u16, ((byte % GRF_BYTES) / 4) as u16)
                    .into()
            }
            Operand::Reg(r) if r.region.is_scalar() => {
                let name = format!("HS_ADDR{}", self.kernel.decls.len());
                let addr = self.kernel.create_decl(DeclareData::new(
                    name,
                    RegFile::Address,
                    ElemType::UW,
                    1,
                ));

                // a0 = &inputs + vertex * per_vertex
                seq.push(
                    InstData::new(Opcode::Shl, 1)
                        .with_dst(RegOperand::dst(addr, ElemType::UW))
                        .with_src(vertex)
                        .with_src(Operand::imm(i64::from(per_vertex.trailing_zeros()), ElemType::UW))
                        .with_no_mask(),
                );
                seq.push(
                    InstData::new(Opcode::Add, 1)
                        .with_dst(RegOperand::dst(addr, ElemType::UW))
                        .with_src(Operand::AddrOf {
                            var: self.inputs,
                            offset: 0,
                        })
                        .with_src(RegOperand::src(addr, ElemType::UW, Region::scalar()))
                        .with_no_mask(),
                );

                RegOperand {
                    base: RegBase::Indirect { addr, imm: 0 },
                    row: 0,
                    sub_reg: 0,
                    region,
                    ty: ElemType::UD,
                    modifier: SrcModifier::None,
                }
                .into()
            }
            other => panic!("input control point index {other:?} is not uniform"),
        }
    }

    fn urb_send(data: &InstData, dst: RegOperand, payload: Declare, msg_len: u32, desc: u32) -> InstData {
        let resp_len = if dst.is_null() {
            0
        } else {
            rows_for(data.exec_size, dst.ty)
        };

        let mut send = InstData::new(Opcode::Send, data.exec_size)
            .with_dst(dst)
            .with_src(RegOperand::src(payload, ElemType::UD, Region::contiguous(8)));

        send.pred = data.pred;
        send.no_mask = data.no_mask;
        send.mask_offset = data.mask_offset;
        send.send = Some(SendDesc {
            sfid: Sfid::Urb,
            msg_len: msg_len as u8,
            resp_len: resp_len as u8,
            desc,
            eot: false,
            header: false,
        });

        send
    }

    // dst = input[src0].attr[src1]
    fn lower_input_read(&mut self, data: &InstData) -> Vec<InstData> {
        assert!(data.exec_size <= 8, "URB reads are at most 8 channels wide");
        assert!(!data.dst.is_null(), "input read without a destination");

        let attr = const_index(&data.srcs[1], "attribute");
        let mut seq = Vec::new();
        let handle = self.input_handle(data.srcs[0], &mut seq);
        let payload = self.payload(1);
        let desc = urb_desc(true, &UrbOffset::Global(attr));

        seq.push(Self::header(payload, handle));
        seq.push(Self::urb_send(data, data.dst, payload, 1, desc));
        seq
    }

    // output[src0].attr[src1] = src2
    fn lower_output_write(&mut self, data: &InstData) -> Vec<InstData> {
        assert!(data.exec_size <= 8, "URB writes are at most 8 channels wide");

        let attr = const_index(&data.srcs[1], "attribute");
        let value = data.srcs[2];
        let offset = match data.srcs[0] {
            Operand::Imm { bits, .. } => {
                let v = bits as u32;

                assert!(
                    v < self.info.output_vertices,
                    "output control point {v} out of range"
                );

                UrbOffset::Global(v * self.info.vertex_stride + attr)
            }
            vertex @ Operand::Reg(_) => UrbOffset::PerSlot(vertex),
            other => panic!("output control point index {other:?} is not a register"),
        };

        let header_rows = match offset {
            UrbOffset::Global(_) => 1,
            UrbOffset::PerSlot(_) => 2,
        };
        let data_rows = rows_for(data.exec_size, value.ty());
        let payload = self.payload(header_rows + data_rows);
        let handle = RegOperand::src(self.output, ElemType::UD, self.info.handle_region());
        let mut seq = vec![Self::header(payload, handle.into())];

        if let UrbOffset::PerSlot(vertex) = offset {
            let slots = RegOperand::dst(payload, ElemType::UD).at(1, 0);
            let mut mul = InstData::new(Opcode::Mul, data.exec_size)
                .with_dst(slots)
                .with_src(vertex)
                .with_src(Operand::imm(i64::from(self.info.vertex_stride), ElemType::UW));
            let mut add = InstData::new(Opcode::Add, data.exec_size)
                .with_dst(slots)
                .with_src(
                    RegOperand::src(payload, ElemType::UD, Region::contiguous(data.exec_size))
                        .at(1, 0),
                )
                .with_src(Operand::imm(i64::from(attr), ElemType::UD));

            for inst in [&mut mul, &mut add] {
                inst.no_mask = data.no_mask;
                inst.mask_offset = data.mask_offset;
            }

            seq.push(mul);
            seq.push(add);
        }

        let mut copy = InstData::new(Opcode::Mov, data.exec_size)
            .with_dst(RegOperand::dst(payload, value.ty()).at(header_rows as u16, 0))
            .with_src(value);

        copy.no_mask = data.no_mask;
        copy.mask_offset = data.mask_offset;
        seq.push(copy);

        let desc = urb_desc(false, &offset);

        seq.push(Self::urb_send(
            data,
            RegOperand::null(ElemType::UD),
            payload,
            header_rows + data_rows,
            desc,
        ));
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PointsToAnalysis;
    use crate::conformity::HwConformity;
    use crate::ir::*;
    use crate::regalloc::RegisterAllocator;
    use crate::testing::*;

    fn info(dispatch: HsDispatch) -> HullShaderInfo {
        HullShaderInfo {
            dispatch,
            input_vertices: 3,
            output_vertices: 4,
            vertex_stride: 4,
        }
    }

    fn idx(v: i64) -> Operand {
        Operand::imm(v, ElemType::UD)
    }

    fn nth(k: &Kernel, n: usize) -> &InstData {
        &k.insts[all_insts(k)[n]]
    }

    #[test]
    fn constant_input_read() {
        let mut k = kernel();
        let x = k.create_decl(DeclareData::grf("X", ElemType::F, 8));
        let mut b = Builder::new(&mut k);

        b.intrinsic(IntrinsicOp::HsInputRead, 8, Some(x), &[idx(2), idx(1)]);
        b.eot();
        k.build_flowgraph();

        let mut lowering = HullShaderLowering::new(&mut k, info(HsDispatch::SingleInstance));

        assert_eq!(lowering.run(), 1);

        let inputs = lowering.input_handles();

        assert_eq!(opcodes(&k), vec![Opcode::Mov, Opcode::Send, Opcode::Send]);

        let handle = nth(&k, 0).srcs[0].as_reg().copied().unwrap();

        assert_eq!(handle.declare(), Some(inputs));
        assert_eq!(handle.sub_reg, 2);
        assert!(handle.region.is_scalar());

        let send = nth(&k, 1);
        let desc = send.send.unwrap();

        assert_eq!(send.dst.declare(), Some(x));
        assert_eq!(desc.sfid, Sfid::Urb);
        assert_eq!(desc.resp_len, 1);
        assert_eq!(desc.desc, URB_READ | (1 << URB_OFFSET_SHIFT));
        assert!(k.decls[inputs].is_input);
    }

    #[test]
    fn dynamic_input_read_goes_through_an_address_register() {
        let mut k = kernel();
        let x = k.create_decl(DeclareData::grf("X", ElemType::F, 8));
        let v = k.create_decl(DeclareData::grf("V", ElemType::D, 1));
        let vs = k.scalar(v);
        let mut b = Builder::new(&mut k);

        b.mov(1, v, Operand::imm(1, ElemType::D));
        b.intrinsic(IntrinsicOp::HsInputRead, 8, Some(x), &[vs, idx(0)]);
        b.eot();
        k.build_flowgraph();

        let mut lowering = HullShaderLowering::new(&mut k, info(HsDispatch::EightPatch));

        lowering.run();

        let inputs = lowering.input_handles();

        assert_eq!(
            opcodes(&k),
            vec![Opcode::Mov, Opcode::Shl, Opcode::Add, Opcode::Mov, Opcode::Send, Opcode::Send]
        );

        // a row of handles per control point
        assert_eq!(nth(&k, 1).srcs[1], Operand::imm(5, ElemType::UW));
        assert!(nth(&k, 3).srcs[0].as_reg().unwrap().is_indirect());

        PointsToAnalysis::compute(&mut k);

        assert!(k.decls[inputs].addr_taken);
    }

    #[test]
    fn constant_output_write() {
        let mut k = kernel();
        let val = k.create_decl(DeclareData::grf("VAL", ElemType::F, 8));
        let vals = k.src(val, 8);
        let mut b = Builder::new(&mut k);

        b.intrinsic(IntrinsicOp::HsOutputWrite, 8, None, &[idx(1), idx(2), vals]);
        b.eot();
        k.build_flowgraph();
        HullShaderLowering::new(&mut k, info(HsDispatch::EightPatch)).run();

        assert_eq!(
            opcodes(&k),
            vec![Opcode::Mov, Opcode::Mov, Opcode::Send, Opcode::Send]
        );

        let copy = nth(&k, 1);

        assert_eq!(copy.dst.row, 1);
        assert_eq!(copy.dst.ty, ElemType::F);

        let send = nth(&k, 2);
        let desc = send.send.unwrap();

        assert!(send.dst.is_null());
        assert_eq!(desc.msg_len, 2);
        assert_eq!(desc.resp_len, 0);
        assert_eq!(desc.desc, 6 << URB_OFFSET_SHIFT);
    }

    #[test]
    fn dynamic_output_write_uses_per_slot_offsets() {
        let mut k = kernel();
        let val = k.create_decl(DeclareData::grf("VAL", ElemType::F, 8));
        let v = k.create_decl(DeclareData::grf("V", ElemType::D, 1));
        let (vals, vs) = (k.src(val, 8), k.scalar(v));
        let mut b = Builder::new(&mut k);

        b.intrinsic(IntrinsicOp::HsOutputWrite, 8, None, &[vs, idx(3), vals]);
        b.eot();
        k.build_flowgraph();
        HullShaderLowering::new(&mut k, info(HsDispatch::SingleInstance)).run();

        assert_eq!(
            opcodes(&k),
            vec![Opcode::Mov, Opcode::Mul, Opcode::Add, Opcode::Mov, Opcode::Send, Opcode::Send]
        );
        assert_eq!(nth(&k, 1).dst.row, 1);
        assert_eq!(nth(&k, 3).dst.row, 2);

        let desc = nth(&k, 4).send.unwrap();

        assert_eq!(desc.msg_len, 3);
        assert_ne!(desc.desc & URB_PER_SLOT_OFFSET, 0);
    }

    #[test]
    fn lowered_kernel_legalizes_and_allocates() {
        let mut k = kernel();
        let x = k.create_decl(DeclareData::grf("X", ElemType::F, 8));
        let v = k.create_decl(DeclareData::grf("V", ElemType::D, 1));
        let (xs, vs) = (k.src(x, 8), k.scalar(v));
        let mut b = Builder::new(&mut k);

        b.mov(1, v, Operand::imm(1, ElemType::D));
        b.intrinsic(IntrinsicOp::HsInputRead, 8, Some(x), &[vs, idx(0)]);
        b.intrinsic(IntrinsicOp::HsOutputWrite, 8, None, &[vs, idx(1), xs]);
        b.eot();
        k.build_flowgraph();

        assert_eq!(HullShaderLowering::new(&mut k, info(HsDispatch::SingleInstance)).run(), 2);

        HwConformity::new(&mut k).run();

        assert!(RegisterAllocator::new(&mut k).run().is_some());
        assert!(!opcodes(&k).iter().any(|op| op.is_pseudo()));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_control_point() {
        let mut k = kernel();
        let x = k.create_decl(DeclareData::grf("X", ElemType::F, 8));
        let mut b = Builder::new(&mut k);

        b.intrinsic(IntrinsicOp::HsInputRead, 8, Some(x), &[idx(3), idx(0)]);
        b.eot();
        k.build_flowgraph();
        HullShaderLowering::new(&mut k, info(HsDispatch::SingleInstance)).run();
    }
}

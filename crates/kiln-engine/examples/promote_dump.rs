//! Dump a method's IR before and after physical struct promotion.
//!
//! Builds a method with a hot aggregate field and a couple of
//! whole-struct copies, runs the phase, and prints both versions:
//!
//! ```sh
//! cargo run --example promote_dump
//! ```

use kiln_engine::jit::ir::{
    BlockId, ClassLayout, FieldDef, LayoutFlags, LocalDesc, MethodIr, NodeKind, PrimType,
};
use kiln_engine::jit::promotion::{run, PromotionConfig};

fn main() {
    let mut ir = MethodIr::new();
    let layout = ir.add_layout(ClassLayout {
        size: 16,
        fields: (0..4)
            .map(|i| FieldDef { offset: i * 4, size: 4, ty: Some(PrimType::I32) })
            .collect(),
        flags: LayoutFlags::empty(),
        gc_slots: vec![],
    });

    let v = ir.add_local(LocalDesc::aggregate(layout));
    ir.local_mut(v).is_param = true;
    let other = ir.add_local(LocalDesc::aggregate(layout));
    ir.local_mut(other).address_exposed = true;
    let sum = ir.add_local(LocalDesc::prim(PrimType::I32));

    let entry = BlockId(0);
    for _ in 0..32 {
        let lhs = ir.new_local_read(sum, PrimType::I32);
        let rhs = ir.new_field_read(v, 0, PrimType::I32);
        let add = ir.add_node(NodeKind::Binary {
            op: kiln_engine::jit::ir::BinOp::Add,
            lhs,
            rhs,
            ty: PrimType::I32,
        });
        let store = ir.new_local_store(sum, PrimType::I32, add);
        ir.add_statement(entry, store);
    }
    let src = ir.add_node(NodeKind::StructRead { local: v, offset: 0, layout });
    let copy = ir.add_node(NodeKind::StructStore { local: other, offset: 0, layout, src });
    ir.add_statement(entry, copy);
    let ret_val = ir.new_local_read(sum, PrimType::I32);
    let ret = ir.add_node(NodeKind::Return { value: Some(ret_val) });
    ir.add_statement(entry, ret);

    println!("=== before promotion ===");
    println!("{ir}");

    let status = run(&mut ir, &PromotionConfig::default());

    println!("=== after promotion ({status:?}) ===");
    println!("{ir}");
}

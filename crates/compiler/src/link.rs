//! Intra-process linking.
//!
//! Merges the global object lists of several translation units into one,
//! by name. Definitions win over declarations; a declaration that meets
//! its definition adopts the definition's type and initializer so AST
//! references through either object see the complete symbol. Two
//! definitions of one name are a hard error; linking a single unit is the
//! identity.

use crate::ast::ObjId;
use crate::error::CompileError;
use crate::Compiler;
use std::collections::HashMap;

fn is_definition(cc: &Compiler, id: ObjId) -> bool {
    let o = cc.objs.get(id);
    o.is_definition && (!o.is_function || o.body.is_some()) || (o.is_function && o.body.is_some())
}

pub(crate) fn link(
    cc: &mut Compiler,
    units: Vec<Vec<ObjId>>,
) -> Result<Vec<ObjId>, CompileError> {
    if units.len() == 1 {
        return Ok(units.into_iter().next().unwrap());
    }

    // First pass: pick a canonical object per name, preferring definitions.
    let mut canonical: HashMap<String, ObjId> = HashMap::new();
    let mut order: Vec<ObjId> = Vec::new();
    for unit in &units {
        for &id in unit {
            let name = cc.objs.get(id).name.clone();
            match canonical.get(&name) {
                None => {
                    canonical.insert(name, id);
                    order.push(id);
                }
                Some(&existing) if existing == id => {}
                Some(&existing) => {
                    let new_def = is_definition(cc, id);
                    let old_def = is_definition(cc, existing);
                    if new_def && old_def {
                        let loc = cc.objs.get(id).loc;
                        return Err(CompileError::Link {
                            loc,
                            msg: format!("redefinition of '{}'", name),
                        });
                    }
                    if new_def {
                        // Replace the declaration in place so objects that
                        // reference it see the full symbol.
                        let idx = order.iter().position(|&o| o == existing).unwrap();
                        order[idx] = id;
                        canonical.insert(name, id);
                        adopt(cc, existing, id);
                    } else {
                        adopt(cc, id, existing);
                    }
                }
            }
        }
    }
    Ok(order)
}

/// Make a declaration mirror its definition.
fn adopt(cc: &mut Compiler, decl: ObjId, def: ObjId) {
    let (ty, init, is_def) = {
        let d = cc.objs.get(def);
        (d.ty, d.init_data.clone(), d.is_definition)
    };
    let o = cc.objs.get_mut(decl);
    o.ty = ty;
    o.init_data = init;
    o.is_definition = is_def;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Compiler;

    fn parse_unit(cc: &mut Compiler, name: &str, src: &str) -> Vec<ObjId> {
        let toks = cc.preprocess_source(name, src).unwrap();
        cc.parse(toks).unwrap()
    }

    #[test]
    fn single_unit_is_identity() {
        let mut cc = Compiler::new();
        let unit = parse_unit(&mut cc, "a.c", "int x; int main(void) { return x; }");
        let before = unit.clone();
        let linked = link(&mut cc, vec![unit]).unwrap();
        assert_eq!(linked, before);
    }

    #[test]
    fn declaration_adopts_definition() {
        let mut cc = Compiler::new();
        let a = parse_unit(&mut cc, "a.c", "int helper(void); int main(void) { return helper(); }");
        let b = parse_unit(&mut cc, "b.c", "int helper(void) { return 42; }");
        let linked = link(&mut cc, vec![a, b]).unwrap();
        let names: Vec<_> = linked
            .iter()
            .map(|&id| cc.objs.get(id).name.clone())
            .collect();
        assert_eq!(
            names.iter().filter(|n| n.as_str() == "helper").count(),
            1,
            "duplicates must collapse: {:?}",
            names
        );
        let helper = linked
            .iter()
            .find(|&&id| cc.objs.get(id).name == "helper")
            .unwrap();
        assert!(cc.objs.get(*helper).body.is_some(), "definition must win");
    }

    #[test]
    fn duplicate_definitions_are_a_hard_error() {
        let mut cc = Compiler::new();
        let a = parse_unit(&mut cc, "a.c", "int f(void) { return 1; }");
        let b = parse_unit(&mut cc, "b.c", "int f(void) { return 2; }");
        assert!(matches!(
            link(&mut cc, vec![a, b]),
            Err(CompileError::Link { .. })
        ));
    }

    #[test]
    fn two_declarations_keep_the_first() {
        let mut cc = Compiler::new();
        let a = parse_unit(&mut cc, "a.c", "extern int x;");
        let b = parse_unit(&mut cc, "b.c", "extern int x;");
        let first = a[0];
        let linked = link(&mut cc, vec![a, b]).unwrap();
        assert_eq!(linked, vec![first]);
    }
}

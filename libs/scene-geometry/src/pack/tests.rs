//! # Device Packer Tests

use super::*;
use crate::scene::{Shader, SHADER_SMOOTH_NORMAL};
use glam::DMat4;

fn quad(offset: DVec3) -> Mesh {
    let mut mesh = Mesh::new("quad");
    for p in [DVec3::ZERO, DVec3::X, DVec3::new(1.0, 1.0, 0.0), DVec3::Y] {
        mesh.add_vertex(p + offset);
    }
    mesh.add_triangle(0, 1, 2, 0, true).unwrap();
    mesh.add_triangle(0, 2, 3, 1, false).unwrap();
    mesh
}

#[test]
fn test_pack_verts_offsets() {
    let mut mesh = quad(DVec3::new(0.0, 0.0, 2.0));
    mesh.tri_offset = 5;

    let mut tri_verts = vec![Float4::default(); 6];
    let mut tri_vindex = vec![[0u32; 4]; 2];
    mesh.pack_verts(&mut tri_verts, &mut tri_vindex, 10);

    assert_eq!(tri_verts[1], [1.0, 0.0, 2.0, 0.0]);
    assert_eq!(tri_verts[5], [0.0, 1.0, 2.0, 0.0]);
    assert_eq!(tri_vindex[0], [10, 11, 12, 15]);
    assert_eq!(tri_vindex[1], [10, 12, 13, 18]);
}

#[test]
fn test_pack_normals_resolves_shaders() {
    let mut shaders = ShaderTable::new();
    let glossy = shaders.add(Shader::new("glossy"));
    let matte = shaders.add(Shader::new("matte"));

    let mut mesh = quad(DVec3::ZERO);
    mesh.used_shaders = vec![glossy, matte];
    mesh.add_vertex_normals();

    let mut tri_shader = vec![0u32; 2];
    let mut vnormal = vec![Float4::default(); 4];
    mesh.pack_normals(&shaders, &mut tri_shader, &mut vnormal);

    assert_eq!(tri_shader, vec![glossy | SHADER_SMOOTH_NORMAL, matte]);
    assert!(vnormal.iter().all(|n| *n == [0.0, 0.0, 1.0, 0.0]));
}

#[test]
fn test_pack_normals_without_attribute() {
    let mesh = quad(DVec3::ZERO);
    let mut tri_shader = vec![0u32; 2];
    let mut vnormal = vec![Float4::default(); 4];
    mesh.pack_normals(&ShaderTable::new(), &mut tri_shader, &mut vnormal);

    // Unbound slots fall back to the default shader.
    assert_eq!(tri_shader, vec![SHADER_SMOOTH_NORMAL, 0]);
    assert_eq!(vnormal[0], [0.0, 0.0, 1.0, 0.0]);
}

#[test]
fn test_pack_normals_flips_mirrored_mesh() {
    let mut mesh = quad(DVec3::ZERO);
    mesh.add_vertex_normals();
    mesh.apply_transform(&DMat4::from_scale(DVec3::new(1.0, 1.0, -1.0)));

    let mut tri_shader = vec![0u32; 2];
    let mut vnormal = vec![Float4::default(); 4];
    mesh.pack_normals(&ShaderTable::new(), &mut tri_shader, &mut vnormal);

    // Mirroring in z turns the geometric normal to -z.
    assert_eq!(vnormal[0], [0.0, 0.0, -1.0, 0.0]);
}

#[test]
fn test_pack_curves() {
    let mut mesh = Mesh::new("hair");
    mesh.used_shaders = vec![3];
    mesh.add_curve_key(DVec3::ZERO, 0.25);
    mesh.add_curve_key(DVec3::Z, 0.5);
    mesh.add_curve(0, 2, 0).unwrap();

    let mut keys = vec![Float4::default(); 2];
    let mut curves = vec![PackedCurve::default(); 1];
    mesh.pack_curves(&ShaderTable::new(), &mut keys, &mut curves, 7);

    assert_eq!(keys[1], [0.0, 0.0, 1.0, 0.5]);
    assert_eq!(
        curves[0],
        PackedCurve {
            first_key: 7,
            num_keys: 2,
            shader: 3,
            pad: 0
        }
    );
}

#[test]
fn test_pack_patches_keeps_triangle_marker() {
    let mut mesh = quad(DVec3::ZERO);
    mesh.add_patch([0, 1, 2, 3], 0, true).unwrap();
    mesh.add_patch([0, 2, 3, NO_VERTEX], 0, true).unwrap();

    let mut patches = vec![PackedPatch::default(); 2];
    mesh.pack_patches(&mut patches, 4);
    assert_eq!(patches[0].v, [4, 5, 6, 7]);
    assert_eq!(patches[1].v, [4, 6, 7, NO_VERTEX]);
}

#[test]
fn test_packing_is_idempotent() {
    let mut shaders = ShaderTable::new();
    let shader = shaders.add(Shader::new("s"));
    let mut mesh = quad(DVec3::new(0.3, 0.1, 0.7));
    mesh.used_shaders = vec![shader, shader];
    mesh.add_vertex_normals();

    let pack = |mesh: &Mesh| {
        let mut tri_verts = vec![Float4::default(); 6];
        let mut tri_vindex = vec![[0u32; 4]; 2];
        let mut tri_shader = vec![0u32; 2];
        let mut vnormal = vec![Float4::default(); 4];
        mesh.pack_verts(&mut tri_verts, &mut tri_vindex, 3);
        mesh.pack_normals(&shaders, &mut tri_shader, &mut vnormal);
        (tri_verts, tri_vindex, tri_shader, vnormal)
    };

    let first = pack(&mesh);
    let second = pack(&mesh);
    assert_eq!(first, second);
    assert_eq!(
        bytemuck::cast_slice::<Float4, u8>(&first.0),
        bytemuck::cast_slice::<Float4, u8>(&second.0)
    );
}

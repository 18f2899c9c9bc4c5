use crate::{
    engine::lin_alg::{Vector2, Vector3},
    renderer::{utilities::AssetCategory, RendererError, Result},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Positions {
    Flat(Vec<Vector2<f32>>),
    Spatial(Vec<Vector3<f32>>),
}

/// Vertex attributes of one asset, one stream per attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexBlob {
    pub positions: Positions,
    pub texcoords: Option<Vec<Vector2<f32>>>,
    pub normals: Option<Vec<Vector3<f32>>>,
}

impl VertexBlob {
    pub fn flat(positions: Vec<Vector2<f32>>) -> Self {
        Self {
            positions: Positions::Flat(positions),
            texcoords: None,
            normals: None,
        }
    }

    pub fn spatial(positions: Vec<Vector3<f32>>) -> Self {
        Self {
            positions: Positions::Spatial(positions),
            texcoords: None,
            normals: None,
        }
    }

    pub fn with_texcoords(mut self, texcoords: Vec<Vector2<f32>>) -> Self {
        self.texcoords = Some(texcoords);
        self
    }

    pub fn with_normals(mut self, normals: Vec<Vector3<f32>>) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn vertex_count(&self) -> usize {
        match &self.positions {
            Positions::Flat(p) => p.len(),
            Positions::Spatial(p) => p.len(),
        }
    }
}

/// Offsets of an asset's streams inside the main buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainBufferOffsets {
    pub position: u64,
    pub texcoord: Option<u64>,
    pub normal: Option<u64>,
    pub index: u64,
}

impl MainBufferOffsets {
    /// Every region start, for releasing them.
    pub fn regions(&self) -> impl Iterator<Item = u64> {
        [
            Some(self.position),
            self.texcoord,
            self.normal,
            Some(self.index),
        ]
        .into_iter()
        .flatten()
    }
}

/// Byte views of the streams a category actually draws with.
#[derive(Debug, Clone, Copy)]
pub struct MeshStreams<'a> {
    pub position: &'a [u8],
    pub texcoord: Option<&'a [u8]>,
    pub normal: Option<&'a [u8]>,
    pub index: &'a [u8],
    pub index_count: u32,
}

/// Checks `blob` against the attribute layout of `category` and returns
/// the byte streams to upload. Attributes the category does not draw with
/// are left out.
pub fn prepare<'a>(
    blob: &'a VertexBlob,
    indices: &'a [u32],
    category: AssetCategory,
) -> Result<MeshStreams<'a>> {
    let invalid = |reason| RendererError::InvalidMesh { category, reason };

    let vertex_count = blob.vertex_count();
    if vertex_count == 0 {
        return Err(invalid("no vertices"));
    }
    if indices.is_empty() || indices.len() % 3 != 0 {
        return Err(invalid("index count is not a non-zero multiple of 3"));
    }
    if indices.iter().any(|&i| i as usize >= vertex_count) {
        return Err(invalid("index out of range"));
    }

    let position: &[u8] = match (&blob.positions, category.is_3d()) {
        (Positions::Flat(p), false) => bytemuck::cast_slice(p),
        (Positions::Spatial(p), true) => bytemuck::cast_slice(p),
        _ => return Err(invalid("position dimension does not match the category")),
    };

    let texcoord = if category.is_mapped() {
        match &blob.texcoords {
            Some(t) if t.len() == vertex_count => Some(bytemuck::cast_slice(t)),
            Some(_) => return Err(invalid("texcoord count differs from vertex count")),
            None => return Err(invalid("mapped category without texcoords")),
        }
    } else {
        None
    };

    let normal = if category.is_3d() {
        match &blob.normals {
            Some(n) if n.len() == vertex_count => Some(bytemuck::cast_slice(n)),
            Some(_) => return Err(invalid("normal count differs from vertex count")),
            None => return Err(invalid("3D category without normals")),
        }
    } else {
        None
    };

    if (!category.is_mapped() && blob.texcoords.is_some())
        || (!category.is_3d() && blob.normals.is_some())
    {
        log::debug!("{category} asset: ignoring attributes the category does not use");
    }

    Ok(MeshStreams {
        position,
        texcoord,
        normal,
        index: bytemuck::cast_slice(indices),
        index_count: indices.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> VertexBlob {
        VertexBlob::flat(vec![
            Vector2::new(-0.5, -0.5),
            Vector2::new(0.5, -0.5),
            Vector2::new(0.5, 0.5),
            Vector2::new(-0.5, 0.5),
        ])
    }

    const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

    #[test]
    fn unmapped_quad_uploads_positions_and_indices() {
        let blob = quad();
        let streams = prepare(&blob, &QUAD_INDICES, AssetCategory::Unmapped2D).unwrap();
        assert_eq!(streams.position.len(), 4 * 8);
        assert_eq!(streams.index.len(), 6 * 4);
        assert_eq!(streams.index_count, 6);
        assert!(streams.texcoord.is_none() && streams.normal.is_none());
    }

    #[test]
    fn extra_attributes_are_dropped() {
        let blob = quad().with_texcoords(vec![Vector2::default(); 4]);
        let streams = prepare(&blob, &QUAD_INDICES, AssetCategory::Unmapped2D).unwrap();
        assert!(streams.texcoord.is_none());

        let streams = prepare(&blob, &QUAD_INDICES, AssetCategory::Mapped2D).unwrap();
        assert_eq!(streams.texcoord.map(<[u8]>::len), Some(32));
    }

    #[test]
    fn layout_mismatches_are_rejected() {
        let blob = quad();
        let reject = |blob: &VertexBlob, indices: &[u32], category| {
            matches!(
                prepare(blob, indices, category),
                Err(RendererError::InvalidMesh { .. })
            )
        };

        assert!(reject(&blob, &QUAD_INDICES, AssetCategory::Mapped2D));
        assert!(reject(&blob, &QUAD_INDICES, AssetCategory::Unmapped3D));
        assert!(reject(&blob, &[0, 1], AssetCategory::Unmapped2D));
        assert!(reject(&blob, &[0, 1, 4], AssetCategory::Unmapped2D));
        assert!(reject(
            &VertexBlob::flat(Vec::new()),
            &QUAD_INDICES,
            AssetCategory::Unmapped2D
        ));

        let triangle = VertexBlob::spatial(vec![Vector3::default(); 3])
            .with_normals(vec![Vector3::default(); 2]);
        assert!(reject(&triangle, &[0, 1, 2], AssetCategory::Unmapped3D));
    }

    #[test]
    fn offsets_list_present_streams() {
        let offsets = MainBufferOffsets {
            position: 0,
            texcoord: None,
            normal: Some(64),
            index: 128,
        };
        assert_eq!(offsets.regions().collect::<Vec<_>>(), [0, 64, 128]);
    }
}

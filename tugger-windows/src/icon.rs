// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Icon groups.

A `.ico` file holds an `ICONDIR` header followed by entries pointing at
image payloads. In a PE image each payload becomes an `RT_ICON` resource and
a `GRPICONDIR` (the same header, with resource ids instead of file offsets)
becomes the `RT_GROUP_ICON` resource.
*/

use {
    crate::resources::{ResourceData, ResourceId, ResourceTable, RT_GROUP_ICON, RT_ICON},
    anyhow::{anyhow, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IconImage {
    pub width: u8,
    pub height: u8,
    pub color_count: u8,
    pub planes: u16,
    pub bit_count: u16,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IconGroup {
    pub images: Vec<IconImage>,
}

impl IconGroup {
    /// Parse an `.ico` file.
    pub fn from_ico(data: &[u8]) -> Result<Self> {
        if data.len() < 6 || LittleEndian::read_u16(&data[0..2]) != 0 || LittleEndian::read_u16(&data[2..4]) != 1
        {
            return Err(anyhow!("not an icon file"));
        }

        let count = LittleEndian::read_u16(&data[4..6]) as usize;
        let mut images = vec![];

        for i in 0..count {
            let entry = data
                .get(6 + i * 16..6 + (i + 1) * 16)
                .ok_or_else(|| anyhow!("icon directory truncated"))?;
            let size = LittleEndian::read_u32(&entry[8..12]) as usize;
            let offset = LittleEndian::read_u32(&entry[12..16]) as usize;

            let payload = data
                .get(offset..offset + size)
                .ok_or_else(|| anyhow!("icon image {} out of bounds", i))?;

            images.push(IconImage {
                width: entry[0],
                height: entry[1],
                color_count: entry[2],
                planes: LittleEndian::read_u16(&entry[4..6]),
                bit_count: LittleEndian::read_u16(&entry[6..8]),
                data: payload.to_vec(),
            });
        }

        if images.is_empty() {
            return Err(anyhow!("icon file contains no images"));
        }

        Ok(Self { images })
    }

    /// Encode the `GRPICONDIR` for images numbered from `first_id`.
    pub fn group_directory(&self, first_id: u16) -> Result<Vec<u8>> {
        let mut out = vec![];
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(1)?;
        out.write_u16::<LittleEndian>(self.images.len() as u16)?;

        for (i, image) in self.images.iter().enumerate() {
            out.push(image.width);
            out.push(image.height);
            out.push(image.color_count);
            out.push(0);
            out.write_u16::<LittleEndian>(image.planes)?;
            out.write_u16::<LittleEndian>(image.bit_count)?;
            out.write_u32::<LittleEndian>(image.data.len() as u32)?;
            out.write_u16::<LittleEndian>(first_id + i as u16)?;
        }

        Ok(out)
    }

    /// Replace every icon of a resource table with this group.
    pub fn install(&self, table: &mut ResourceTable, lang: u16) -> Result<()> {
        table.remove_type(&ResourceId::Id(RT_GROUP_ICON));
        table.remove_type(&ResourceId::Id(RT_ICON));

        for (i, image) in self.images.iter().enumerate() {
            table.set(RT_ICON, 1 + i as u16, lang, ResourceData::new(image.data.clone()));
        }
        table.set(RT_GROUP_ICON, 1u16, lang, ResourceData::new(self.group_directory(1)?));

        Ok(())
    }
}
